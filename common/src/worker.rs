use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::task::TaskId;

pub type WorkerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    pub cpu_percent: f32,
    pub mem_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
    /// Assignment handles the worker must kill.
    #[serde(default)]
    pub cancel: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub worker_id: WorkerId,
}

/// One task attempt handed to a worker. The work directory lives on storage
/// shared by the master and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub handle: String,
    pub task_id: TaskId,
    pub name: String,
    pub work_dir: PathBuf,
    pub time_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentResponse {
    pub assignment: Option<Assignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentComplete {
    pub worker_id: WorkerId,
    pub handle: String,
    /// `None` when the script could not be started at all.
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentCompleteResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub queued: u32,
    pub active_tasks: u32,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}
