use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::output::ResolvedOutput;
use crate::task::{NodeId, TaskId, TaskState};

/// Timestamped state transition of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub attempt: u32,
    pub node: Option<NodeId>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// One submission of a task to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub executor: String,
    pub node: NodeId,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
}

/// Read-only view of a task for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub executor: String,
    pub work_dir: Option<PathBuf>,
    pub attempts: u32,
    pub nodes_tried: Vec<NodeId>,
    pub history: Vec<AttemptRecord>,
    pub outputs: Vec<ResolvedOutput>,
    pub error: Option<String>,
    pub cached: bool,
    pub updated_at: DateTime<Utc>,
}

/// Terminal result handed back to the data-flow layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Completed {
        id: TaskId,
        name: String,
        work_dir: PathBuf,
        outputs: Vec<ResolvedOutput>,
        cached: bool,
    },
    Failed {
        id: TaskId,
        name: String,
        work_dir: Option<PathBuf>,
        cause: String,
        history: Vec<AttemptRecord>,
    },
    /// Failed under the IGNORE strategy; the run goes on.
    Ignored {
        id: TaskId,
        name: String,
        work_dir: Option<PathBuf>,
        cause: String,
    },
    Aborted {
        id: TaskId,
        name: String,
    },
}

impl TaskOutcome {
    pub fn id(&self) -> &str {
        match self {
            TaskOutcome::Completed { id, .. }
            | TaskOutcome::Failed { id, .. }
            | TaskOutcome::Ignored { id, .. }
            | TaskOutcome::Aborted { id, .. } => id,
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed { .. } => TaskState::Completed,
            TaskOutcome::Failed { .. } => TaskState::Failed,
            TaskOutcome::Ignored { .. } => TaskState::Ignored,
            TaskOutcome::Aborted { .. } => TaskState::Aborted,
        }
    }
}

/// Snapshot of the failover counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverStats {
    pub max_failover_attempts: u32,
    /// Jobs reassigned to another node, stolen ones included.
    pub total_failed_over: u64,
    pub total_stolen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: TaskId,
    /// The identity was already active; nothing new was queued.
    pub duplicate: bool,
}
