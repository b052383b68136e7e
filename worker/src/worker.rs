use anyhow::{Context, Result};
use common::workdir::{write_exit_code, SCRIPT_FILE, STDERR_FILE, STDOUT_FILE};
use common::{
    Assignment, AssignmentComplete, AssignmentRequest, AssignmentResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::{
    collections::HashMap,
    env,
    fs::File,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::process::Command;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub base_url: String,
    pub max_concurrency: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| env::var(k).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            base_url: lookup("MASTER_BASE_URL").unwrap_or_else(|| "http://master:8080".to_string()),
            max_concurrency: lookup("WORKER_CONCURRENCY")
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
        }
    }
}

/// How one assignment ended on this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptResult {
    Exited(i32),
    Error(String),
    /// Killed on the master's request; nothing is reported back.
    Cancelled,
}

// handle -> kill switch of the running script
type CancelMap = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;
// replaced when the master forgets us and we register again
type SharedId = Arc<Mutex<String>>;

/// Main worker loop:
/// - registers with the master
/// - heartbeats in the background and applies cancellations
/// - pulls assignments while it has free slots
/// - runs each script in parallel (up to WORKER_CONCURRENCY)
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let cfg = WorkerConfig::from_env();
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let registration = WorkerRegisterRequest {
        hostname,
        max_concurrency: cfg.max_concurrency,
    };
    let first_id = register(&client, &cfg.base_url, &registration).await?;

    info!(
        "worker {} registered with concurrency={} against {}",
        first_id, cfg.max_concurrency, cfg.base_url
    );

    let worker_id: SharedId = Arc::new(Mutex::new(first_id));
    let cancels: CancelMap = Arc::default();
    tokio::spawn(heartbeat_loop(
        client.clone(),
        cfg.base_url.clone(),
        registration,
        worker_id.clone(),
        cancels.clone(),
    ));

    let sem = Arc::new(Semaphore::new(cfg.max_concurrency as usize));
    loop {
        let permit = sem.clone().acquire_owned().await?;
        let worker_id = lock(&worker_id).clone();

        let assignment = match fetch_assignment(&client, &cfg.base_url, &worker_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                drop(permit);
                debug!("no assignment for worker {}", worker_id);
                sleep(IDLE_BACKOFF).await;
                continue;
            }
            Err(e) => {
                drop(permit);
                warn!("asking for an assignment failed: {:#}", e);
                sleep(IDLE_BACKOFF).await;
                continue;
            }
        };

        info!(
            "got {} ({}) in {}",
            assignment.name,
            assignment.handle,
            assignment.work_dir.display()
        );
        let (cancel_tx, cancel_rx) = oneshot::channel();
        lock(&cancels).insert(assignment.handle.clone(), cancel_tx);

        let client = client.clone();
        let base_url = cfg.base_url.clone();
        let cancels = cancels.clone();
        tokio::spawn(async move {
            let result = run_script(&assignment, cancel_rx).await;
            lock(&cancels).remove(&assignment.handle);

            let (exit_code, error) = match result {
                ScriptResult::Exited(code) => (Some(code), None),
                ScriptResult::Error(e) => (None, Some(e)),
                ScriptResult::Cancelled => {
                    info!("{} cancelled", assignment.handle);
                    return;
                }
            };
            let report = AssignmentComplete {
                worker_id,
                handle: assignment.handle.clone(),
                exit_code,
                error,
            };
            let url = format!("{}/api/v1/assignments/complete", base_url);
            if let Err(e) = client.post(&url).json(&report).send().await {
                warn!("reporting {} failed: {}", assignment.handle, e);
            }
            // frees the slot
            drop(permit);
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

async fn fetch_assignment(
    client: &Client,
    base_url: &str,
    worker_id: &str,
) -> Result<Option<Assignment>> {
    let url = format!("{}/api/v1/assignments/next", base_url);
    let resp: AssignmentResponse = client
        .post(&url)
        .json(&AssignmentRequest {
            worker_id: worker_id.to_string(),
        })
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(resp.assignment)
}

async fn register(
    client: &Client,
    base_url: &str,
    registration: &WorkerRegisterRequest,
) -> Result<String> {
    let url = format!("{}/api/v1/workers/register", base_url);
    let WorkerRegisterResponse { worker_id } = client
        .post(&url)
        .json(registration)
        .send()
        .await
        .with_context(|| format!("registering with {}", base_url))?
        .error_for_status()?
        .json()
        .await?;
    Ok(worker_id)
}

async fn heartbeat_loop(
    client: Client,
    base_url: String,
    registration: WorkerRegisterRequest,
    worker_id: SharedId,
    cancels: CancelMap,
) {
    let mut sys = System::new_all();

    loop {
        sys.refresh_cpu();
        sys.refresh_memory();
        // used_memory is in KB
        let usage = (sys.global_cpu_info().cpu_usage(), sys.used_memory() * 1024);

        if let Err(e) =
            heartbeat_once(&client, &base_url, &registration, &worker_id, &cancels, usage).await
        {
            warn!("heartbeat failed: {:#}", e);
        }
        sleep(HEARTBEAT_INTERVAL).await;
    }
}

/// Sends one heartbeat and applies the cancellations in the reply.
///
/// A 404 means the master no longer knows this worker id, e.g. after a
/// restart. The worker then registers again and kills whatever it is still
/// running, since the new master has no record of those scripts.
async fn heartbeat_once(
    client: &Client,
    base_url: &str,
    registration: &WorkerRegisterRequest,
    worker_id: &SharedId,
    cancels: &CancelMap,
    (cpu_percent, mem_bytes): (f32, u64),
) -> Result<()> {
    let url = format!("{}/api/v1/workers/heartbeat", base_url);
    let req = WorkerHeartbeatRequest {
        worker_id: lock(worker_id).clone(),
        cpu_percent,
        mem_bytes,
    };

    let resp = client.post(&url).json(&req).send().await?;
    if resp.status() == StatusCode::NOT_FOUND {
        let fresh = register(client, base_url, registration).await?;
        warn!(
            "master does not know worker {}, registered again as {}",
            req.worker_id, fresh
        );
        *lock(worker_id) = fresh;
        let handles: Vec<String> = lock(cancels).keys().cloned().collect();
        let n = apply_cancellations(cancels, &handles);
        if n > 0 {
            info!("killed {} script(s) started under the old id", n);
        }
        return Ok(());
    }

    let hb: WorkerHeartbeatResponse = resp.error_for_status()?.json().await?;
    let n = apply_cancellations(cancels, &hb.cancel);
    if n > 0 {
        info!("cancelled {} running script(s)", n);
    }
    Ok(())
}

fn apply_cancellations(cancels: &CancelMap, handles: &[String]) -> usize {
    let mut map = lock(cancels);
    handles
        .iter()
        .filter_map(|h| map.remove(h))
        .map(|tx| tx.send(()).is_ok())
        .filter(|sent| *sent)
        .count()
}

/// Runs `.command.sh` in the assignment's work directory and records its
/// exit code next to it.
pub async fn run_script(a: &Assignment, cancel: oneshot::Receiver<()>) -> ScriptResult {
    let out = match File::create(a.work_dir.join(STDOUT_FILE)) {
        Ok(f) => f,
        Err(e) => return ScriptResult::Error(format!("creating stdout file: {e}")),
    };
    let err = match File::create(a.work_dir.join(STDERR_FILE)) {
        Ok(f) => f,
        Err(e) => return ScriptResult::Error(format!("creating stderr file: {e}")),
    };

    let mut child = match Command::new("bash")
        .arg(SCRIPT_FILE)
        .current_dir(&a.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => return ScriptResult::Error(format!("spawning bash: {e}")),
    };

    let limit = a.time_secs;
    let deadline = async move {
        match limit {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                match write_exit_code(&a.work_dir, code) {
                    Ok(()) => ScriptResult::Exited(code),
                    Err(e) => ScriptResult::Error(format!("writing exit code: {e}")),
                }
            }
            Err(e) => ScriptResult::Error(e.to_string()),
        },
        Ok(()) = cancel => {
            let _ = child.kill().await;
            ScriptResult::Cancelled
        }
        _ = deadline => {
            let _ = child.kill().await;
            ScriptResult::Error(format!("wall time of {}s exceeded", limit.unwrap_or_default()))
        }
    }
}
