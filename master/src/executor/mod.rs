//! Backend contract: submit, poll, cancel. Every call is non-blocking or
//! bounded; the monitor wraps them in timeouts on top of that.

mod local;
#[cfg(test)]
pub mod mock;
mod workers;

use async_trait::async_trait;
use std::{path::PathBuf, time::Duration};

use common::{NodeId, ResourceRequest, TaskError, TaskId};

pub use local::{LocalExecutor, LOCAL_NODE};
pub use workers::{run_sweep_loop, WorkerPool};

/// Capacity snapshot of one execution endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub slots: u32,
    pub running: u32,
    pub available: bool,
}

impl NodeInfo {
    pub fn free(&self) -> u32 {
        if self.available {
            self.slots.saturating_sub(self.running)
        } else {
            0
        }
    }

    /// Room for one attempt of a task with these resources.
    pub fn fits(&self, resources: &ResourceRequest) -> bool {
        self.free() >= resources.slots_on(self.slots)
    }
}

/// What an executor needs to launch one attempt of a task.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: TaskId,
    pub name: String,
    pub work_dir: PathBuf,
    pub resources: ResourceRequest,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub id: String,
    pub node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    NodeLost(NodeId),
    WallTime(u64),
    Backend(String),
}

impl From<FailureCause> for TaskError {
    fn from(cause: FailureCause) -> Self {
        match cause {
            FailureCause::NodeLost(node) => TaskError::NodeUnavailable { node },
            FailureCause::WallTime(secs) => TaskError::WallTimeExceeded { secs },
            FailureCause::Backend(msg) => TaskError::Backend(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Accepted by the backend, not started yet.
    Pending,
    Running,
    Completed { exit_code: i32 },
    Failed(FailureCause),
    /// The backend cannot tell right now; ask again later.
    Unknown,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    fn nodes(&self) -> Vec<NodeInfo>;

    /// Hands the task to `node`. Fails fast with `BackendSaturated` when
    /// the node has no free slot.
    async fn submit(&self, sub: &Submission, node: &NodeId) -> Result<Handle, TaskError>;

    async fn poll(&self, handle: &Handle) -> PollStatus;

    /// Best effort, no confirmation.
    async fn cancel(&self, handle: &Handle);

    /// How long `Unknown` is tolerated before the node counts as lost.
    fn unknown_timeout(&self) -> Duration;
}
