use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime},
};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use common::{
    Assignment, AssignmentComplete, NodeId, TaskError, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerId, WorkerMetrics, WorkerRegisterRequest,
};

use super::{Executor, FailureCause, Handle, NodeInfo, PollStatus, Submission};

/// Without a heartbeat for this long, polls on the worker answer `Unknown`.
pub const WORKER_STALE_AFTER: Duration = Duration::from_secs(10);
/// Without a heartbeat for this long, the sweep declares the worker dead.
pub const WORKER_DEAD_TIMEOUT: Duration = Duration::from_secs(20);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct WorkerMeta {
    hostname: String,
    last_heartbeat: SystemTime,
    dead: bool,
    max_concurrency: u32,
    queue: VecDeque<String>,
    running: HashSet<String>,
    // Handles the worker has to kill, delivered with the next heartbeat.
    cancel: Vec<String>,

    tasks_started: u64,
    tasks_succeeded: u64,
    tasks_failed: u64,
    last_cpu_percent: Option<f32>,
    last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    /// Slots taken by queued and running jobs.
    fn load(&self, jobs: &HashMap<String, RemoteJob>) -> u32 {
        self.queue
            .iter()
            .chain(self.running.iter())
            .map(|h| jobs.get(h).map_or(1, |j| j.slots))
            .sum()
    }

    fn silent_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_heartbeat).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
enum RemoteStatus {
    Queued,
    Running,
    Done(i32),
    Error(String),
    Lost,
}

#[derive(Debug, Clone)]
struct RemoteJob {
    assignment: Assignment,
    worker_id: WorkerId,
    slots: u32,
    status: RemoteStatus,
}

#[derive(Default)]
struct PoolInner {
    workers: HashMap<WorkerId, WorkerMeta>,
    // registration order, used to list nodes deterministically
    order: Vec<WorkerId>,
    jobs: HashMap<String, RemoteJob>,
}

/// Executor backed by remote workers that register, heartbeat and pull
/// their assignments from the master.
pub struct WorkerPool {
    name: String,
    unknown_timeout: Duration,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, unknown_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            unknown_timeout,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /* ---------------- worker-facing API ---------------- */

    pub fn register(&self, req: WorkerRegisterRequest) -> WorkerId {
        let worker_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.lock();
        inner.workers.insert(
            worker_id.clone(),
            WorkerMeta {
                hostname: req.hostname.clone(),
                last_heartbeat: SystemTime::now(),
                dead: false,
                max_concurrency: req.max_concurrency.max(1),
                queue: VecDeque::new(),
                running: HashSet::new(),
                cancel: Vec::new(),
                tasks_started: 0,
                tasks_succeeded: 0,
                tasks_failed: 0,
                last_cpu_percent: None,
                last_mem_bytes: None,
            },
        );
        inner.order.push(worker_id.clone());
        info!(
            "worker registered: {} (host={}, max_concurrency={})",
            worker_id, req.hostname, req.max_concurrency
        );
        worker_id
    }

    /// `None` when the worker is not registered.
    pub fn heartbeat(&self, req: WorkerHeartbeatRequest) -> Option<WorkerHeartbeatResponse> {
        let mut inner = self.lock();
        let meta = inner.workers.get_mut(&req.worker_id)?;
        if meta.dead {
            info!(
                "worker {} is back after being declared dead, {} orphan(s) to kill",
                req.worker_id,
                meta.cancel.len()
            );
            meta.dead = false;
        }
        meta.last_heartbeat = SystemTime::now();
        meta.last_cpu_percent = Some(req.cpu_percent);
        meta.last_mem_bytes = Some(req.mem_bytes);
        let cancel = std::mem::take(&mut meta.cancel);
        debug!("heartbeat from {} ({} cancellation(s))", req.worker_id, cancel.len());
        Some(WorkerHeartbeatResponse { ok: true, cancel })
    }

    pub fn next_assignment(&self, worker_id: &str) -> Option<Assignment> {
        let mut inner = self.lock();
        let PoolInner { workers, jobs, .. } = &mut *inner;
        let meta = workers.get_mut(worker_id).filter(|m| !m.dead)?;

        while let Some(handle) = meta.queue.pop_front() {
            let Some(job) = jobs.get_mut(&handle) else {
                continue;
            };
            job.status = RemoteStatus::Running;
            meta.running.insert(handle.clone());
            meta.tasks_started += 1;
            info!(
                "assigning {} ({}) to worker {}",
                job.assignment.name, handle, worker_id
            );
            return Some(job.assignment.clone());
        }
        None
    }

    /// Records the worker's report. Late reports for jobs already failed
    /// over or cancelled are dropped.
    pub fn complete(&self, req: AssignmentComplete) -> bool {
        let mut inner = self.lock();
        let PoolInner { workers, jobs, .. } = &mut *inner;

        let Some(job) = jobs.get_mut(&req.handle) else {
            debug!("ignoring report for unknown handle {}", req.handle);
            return false;
        };
        if job.worker_id != req.worker_id || !matches!(job.status, RemoteStatus::Running) {
            warn!(
                "ignoring stale report for {} from worker {}",
                req.handle, req.worker_id
            );
            return false;
        }

        let ok = req.exit_code.is_some() && req.error.is_none();
        job.status = match (req.exit_code, req.error) {
            (_, Some(err)) => RemoteStatus::Error(err),
            (Some(code), None) => RemoteStatus::Done(code),
            (None, None) => RemoteStatus::Error("worker reported no exit code".into()),
        };

        if let Some(meta) = workers.get_mut(&req.worker_id) {
            meta.running.remove(&req.handle);
            if ok {
                meta.tasks_succeeded += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }
        true
    }

    pub fn metrics(&self) -> Vec<WorkerMetrics> {
        let inner = self.lock();
        let now = SystemTime::now();
        inner
            .order
            .iter()
            .filter_map(|id| inner.workers.get(id).map(|m| (id, m)))
            .map(|(id, m)| WorkerMetrics {
                worker_id: id.clone(),
                hostname: m.hostname.clone(),
                dead: m.dead,
                max_concurrency: m.max_concurrency,
                last_heartbeat_secs_ago: m.silent_for(now).as_secs(),
                queued: m.queue.len() as u32,
                active_tasks: m.running.len() as u32,
                tasks_started: m.tasks_started,
                tasks_succeeded: m.tasks_succeeded,
                tasks_failed: m.tasks_failed,
                cpu_percent: m.last_cpu_percent,
                mem_bytes: m.last_mem_bytes,
            })
            .collect()
    }

    /// One pass of the heartbeat check: marks silent workers dead and
    /// flags their jobs as lost. Returns the newly dead workers.
    pub fn sweep_once(&self, now: SystemTime) -> Vec<WorkerId> {
        let mut inner = self.lock();
        let PoolInner { workers, jobs, .. } = &mut *inner;

        let mut newly_dead = Vec::new();
        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            let elapsed = meta.silent_for(now);
            if elapsed > WORKER_DEAD_TIMEOUT {
                warn!(
                    "marking worker {} DEAD (no heartbeat for {:?})",
                    worker_id, elapsed
                );
                meta.dead = true;
                meta.queue.clear();
                // whatever it was running is failed over; kill it if it comes back
                let mut orphans: Vec<String> = meta.running.drain().collect();
                orphans.sort();
                meta.cancel.extend(orphans);
                newly_dead.push(worker_id.clone());
            }
        }

        if newly_dead.is_empty() {
            return newly_dead;
        }

        let mut lost = 0;
        for job in jobs.values_mut() {
            if newly_dead.contains(&job.worker_id)
                && matches!(job.status, RemoteStatus::Queued | RemoteStatus::Running)
            {
                job.status = RemoteStatus::Lost;
                lost += 1;
            }
        }
        info!(
            "sweep: {} dead worker(s), {} job(s) lost",
            newly_dead.len(),
            lost
        );
        newly_dead
    }

    #[cfg(test)]
    fn backdate_heartbeat(&self, worker_id: &str, by: Duration) {
        let mut inner = self.lock();
        if let Some(meta) = inner.workers.get_mut(worker_id) {
            meta.last_heartbeat -= by;
        }
    }
}

pub async fn run_sweep_loop(pool: Arc<WorkerPool>) {
    loop {
        sleep(SWEEP_INTERVAL).await;
        pool.sweep_once(SystemTime::now());
    }
}

#[async_trait]
impl Executor for WorkerPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        let inner = self.lock();
        let now = SystemTime::now();
        inner
            .order
            .iter()
            .filter_map(|id| inner.workers.get(id).map(|m| (id, m)))
            .map(|(id, m)| NodeInfo {
                id: id.clone(),
                slots: m.max_concurrency,
                running: m.load(&inner.jobs),
                available: !m.dead && m.silent_for(now) <= WORKER_STALE_AFTER,
            })
            .collect()
    }

    async fn submit(&self, sub: &Submission, node: &NodeId) -> Result<Handle, TaskError> {
        let mut inner = self.lock();
        let PoolInner { workers, jobs, .. } = &mut *inner;

        let meta = workers
            .get_mut(node)
            .filter(|m| !m.dead)
            .ok_or_else(|| TaskError::NodeUnavailable { node: node.clone() })?;
        let slots = sub.resources.slots_on(meta.max_concurrency);
        if meta.load(jobs) + slots > meta.max_concurrency {
            return Err(TaskError::BackendSaturated {
                executor: self.name.clone(),
            });
        }

        let handle = uuid::Uuid::new_v4().to_string();
        let assignment = Assignment {
            handle: handle.clone(),
            task_id: sub.task_id.clone(),
            name: sub.name.clone(),
            work_dir: sub.work_dir.clone(),
            time_secs: sub.resources.time_secs,
        };
        jobs.insert(
            handle.clone(),
            RemoteJob {
                assignment,
                worker_id: node.clone(),
                slots,
                status: RemoteStatus::Queued,
            },
        );
        meta.queue.push_back(handle.clone());
        debug!("queued {} for worker {}", sub.name, node);

        Ok(Handle {
            id: handle,
            node: node.clone(),
        })
    }

    async fn poll(&self, handle: &Handle) -> PollStatus {
        let mut inner = self.lock();
        let (status, worker_id) = match inner.jobs.get(&handle.id) {
            Some(job) => (job.status.clone(), job.worker_id.clone()),
            None => return PollStatus::Failed(FailureCause::Backend("unknown handle".into())),
        };

        match status {
            RemoteStatus::Queued | RemoteStatus::Running => {
                let stale = inner
                    .workers
                    .get(&worker_id)
                    .map(|m| m.silent_for(SystemTime::now()) > WORKER_STALE_AFTER)
                    .unwrap_or(true);
                if stale {
                    PollStatus::Unknown
                } else if matches!(status, RemoteStatus::Running) {
                    PollStatus::Running
                } else {
                    PollStatus::Pending
                }
            }
            RemoteStatus::Done(code) => {
                inner.jobs.remove(&handle.id);
                PollStatus::Completed { exit_code: code }
            }
            RemoteStatus::Error(e) => {
                inner.jobs.remove(&handle.id);
                PollStatus::Failed(FailureCause::Backend(e))
            }
            RemoteStatus::Lost => {
                inner.jobs.remove(&handle.id);
                PollStatus::Failed(FailureCause::NodeLost(worker_id))
            }
        }
    }

    async fn cancel(&self, handle: &Handle) {
        let mut inner = self.lock();
        let PoolInner { workers, jobs, .. } = &mut *inner;
        let Some(job) = jobs.remove(&handle.id) else {
            return;
        };
        if let Some(meta) = workers.get_mut(&job.worker_id) {
            meta.queue.retain(|h| h != &handle.id);
            if meta.running.remove(&handle.id) {
                meta.cancel.push(handle.id.clone());
            }
        }
        info!("cancelled {} on worker {}", handle.id, job.worker_id);
    }

    fn unknown_timeout(&self) -> Duration {
        self.unknown_timeout
    }
}
