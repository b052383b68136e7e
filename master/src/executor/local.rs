use async_trait::async_trait;
use std::{
    collections::HashMap,
    fs::File,
    path::PathBuf,
    process::Stdio,
    sync::Mutex,
    time::{Duration, Instant},
};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use common::workdir::{write_exit_code, SCRIPT_FILE, STDERR_FILE, STDOUT_FILE};
use common::{NodeId, TaskError};

use super::{Executor, FailureCause, Handle, NodeInfo, PollStatus, Submission};

pub const LOCAL_NODE: &str = "local";

struct LocalProc {
    child: Child,
    slots: u32,
    work_dir: PathBuf,
    started_at: Instant,
    time_limit: Option<Duration>,
    killed_for_time: bool,
}

/// Runs each task as a `bash` child process on this host.
pub struct LocalExecutor {
    name: String,
    slots: u32,
    unknown_timeout: Duration,
    procs: Mutex<HashMap<String, LocalProc>>,
}

impl LocalExecutor {
    pub fn new(name: impl Into<String>, slots: u32, unknown_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            slots: slots.max(1),
            unknown_timeout,
            procs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LocalProc>> {
        self.procs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn slots_in_use(procs: &HashMap<String, LocalProc>) -> u32 {
    procs.values().map(|p| p.slots).sum()
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        vec![NodeInfo {
            id: LOCAL_NODE.to_string(),
            slots: self.slots,
            running: slots_in_use(&self.lock()),
            available: true,
        }]
    }

    async fn submit(&self, sub: &Submission, node: &NodeId) -> Result<Handle, TaskError> {
        if node != LOCAL_NODE {
            return Err(TaskError::NodeUnavailable { node: node.clone() });
        }
        let mut procs = self.lock();
        let slots = sub.resources.slots_on(self.slots);
        if slots_in_use(&procs) + slots > self.slots {
            return Err(TaskError::BackendSaturated {
                executor: self.name.clone(),
            });
        }

        let out = File::create(sub.work_dir.join(STDOUT_FILE))
            .map_err(|e| TaskError::storage(sub.work_dir.join(STDOUT_FILE), e))?;
        let err = File::create(sub.work_dir.join(STDERR_FILE))
            .map_err(|e| TaskError::storage(sub.work_dir.join(STDERR_FILE), e))?;

        let child = Command::new("bash")
            .arg(SCRIPT_FILE)
            .current_dir(&sub.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::Backend(format!("spawning bash: {e}")))?;

        let id = uuid::Uuid::new_v4().to_string();
        info!(
            "launching {} ({}) attempt={} pid={:?}",
            sub.name,
            sub.task_id,
            sub.attempt,
            child.id()
        );
        procs.insert(
            id.clone(),
            LocalProc {
                child,
                slots,
                work_dir: sub.work_dir.clone(),
                started_at: Instant::now(),
                time_limit: sub.resources.time_secs.map(Duration::from_secs),
                killed_for_time: false,
            },
        );
        Ok(Handle {
            id,
            node: LOCAL_NODE.to_string(),
        })
    }

    async fn poll(&self, handle: &Handle) -> PollStatus {
        let mut procs = self.lock();
        let proc = match procs.get_mut(&handle.id) {
            Some(p) => p,
            None => return PollStatus::Failed(FailureCause::Backend("unknown handle".into())),
        };

        match proc.child.try_wait() {
            Ok(Some(status)) => {
                let proc = match procs.remove(&handle.id) {
                    Some(p) => p,
                    None => return PollStatus::Unknown,
                };
                if proc.killed_for_time {
                    let secs = proc.time_limit.map(|d| d.as_secs()).unwrap_or_default();
                    return PollStatus::Failed(FailureCause::WallTime(secs));
                }
                let code = status.code().unwrap_or(-1);
                if let Err(e) = write_exit_code(&proc.work_dir, code) {
                    warn!("cannot write exit code in {}: {}", proc.work_dir.display(), e);
                    return PollStatus::Failed(FailureCause::Backend(e.to_string()));
                }
                debug!("handle {} exited with code {}", handle.id, code);
                PollStatus::Completed { exit_code: code }
            }
            Ok(None) => {
                if let Some(limit) = proc.time_limit {
                    if !proc.killed_for_time && proc.started_at.elapsed() > limit {
                        warn!("handle {} exceeded wall time {:?}, killing", handle.id, limit);
                        let _ = proc.child.start_kill();
                        proc.killed_for_time = true;
                    }
                }
                PollStatus::Running
            }
            Err(e) => PollStatus::Failed(FailureCause::Backend(e.to_string())),
        }
    }

    async fn cancel(&self, handle: &Handle) {
        if let Some(mut proc) = self.lock().remove(&handle.id) {
            let _ = proc.child.start_kill();
            info!("cancelled local task {}", handle.id);
        }
    }

    fn unknown_timeout(&self) -> Duration {
        self.unknown_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ResourceRequest;
    use std::fs;
    use tempfile::tempdir;

    fn submission(dir: &std::path::Path, script: &str) -> Submission {
        fs::write(dir.join(SCRIPT_FILE), script).unwrap();
        Submission {
            task_id: "t1".into(),
            name: "proc".into(),
            work_dir: dir.to_path_buf(),
            resources: ResourceRequest::default(),
            attempt: 1,
        }
    }

    async fn wait(exec: &LocalExecutor, handle: &Handle) -> PollStatus {
        for _ in 0..500 {
            match exec.poll(handle).await {
                PollStatus::Running | PollStatus::Pending => {
                    tokio::time::sleep(Duration::from_millis(10)).await
                }
                other => return other,
            }
        }
        panic!("task never finished");
    }

    #[tokio::test]
    async fn runs_script_and_records_exit_code() {
        let dir = tempdir().unwrap();
        let exec = LocalExecutor::new("local", 2, Duration::from_secs(60));
        let sub = submission(dir.path(), "echo hola > out.txt\nexit 3\n");

        let handle = exec.submit(&sub, &LOCAL_NODE.to_string()).await.unwrap();
        assert_eq!(wait(&exec, &handle).await, PollStatus::Completed { exit_code: 3 });
        assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hola\n");
        assert_eq!(common::workdir::read_exit_code(dir.path()), Some(3));
        assert_eq!(exec.nodes()[0].running, 0);
    }

    #[tokio::test]
    async fn saturated_when_slots_are_full() {
        let dir = tempdir().unwrap();
        let exec = LocalExecutor::new("local", 1, Duration::from_secs(60));
        let sub = submission(dir.path(), "sleep 5\n");
        let node = LOCAL_NODE.to_string();

        let handle = exec.submit(&sub, &node).await.unwrap();
        assert!(matches!(
            exec.submit(&sub, &node).await,
            Err(TaskError::BackendSaturated { .. })
        ));
        exec.cancel(&handle).await;
        assert_eq!(exec.nodes()[0].free(), 1);
    }

    #[tokio::test]
    async fn cpus_take_several_slots() {
        let dir = tempdir().unwrap();
        let exec = LocalExecutor::new("local", 3, Duration::from_secs(60));
        let node = LOCAL_NODE.to_string();
        let mut wide = submission(dir.path(), "sleep 5\n");
        wide.resources.cpus = 2;
        let narrow = submission(dir.path(), "sleep 5\n");

        let first = exec.submit(&wide, &node).await.unwrap();
        assert_eq!(exec.nodes()[0].running, 2);
        assert!(!exec.nodes()[0].fits(&wide.resources));
        assert!(matches!(
            exec.submit(&wide, &node).await,
            Err(TaskError::BackendSaturated { .. })
        ));
        let second = exec.submit(&narrow, &node).await.unwrap();
        assert_eq!(exec.nodes()[0].free(), 0);

        exec.cancel(&first).await;
        exec.cancel(&second).await;
    }

    #[tokio::test]
    async fn other_nodes_are_unavailable() {
        let dir = tempdir().unwrap();
        let exec = LocalExecutor::new("local", 1, Duration::from_secs(60));
        let sub = submission(dir.path(), "true\n");
        assert!(matches!(
            exec.submit(&sub, &"elsewhere".to_string()).await,
            Err(TaskError::NodeUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn wall_time_is_enforced() {
        let dir = tempdir().unwrap();
        let exec = LocalExecutor::new("local", 1, Duration::from_secs(60));
        let mut sub = submission(dir.path(), "sleep 30\n");
        sub.resources.time_secs = Some(0);

        let handle = exec.submit(&sub, &LOCAL_NODE.to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            wait(&exec, &handle).await,
            PollStatus::Failed(FailureCause::WallTime(0))
        );
    }
}
