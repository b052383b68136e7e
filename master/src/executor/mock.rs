//! Scripted executor for monitor tests.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use common::{NodeId, TaskError, TaskId};

use super::{Executor, Handle, NodeInfo, PollStatus, Submission};

pub struct MockExecutor {
    name: String,
    slots: Vec<(NodeId, u32)>,
    /// Status answered for every poll of a job on that node.
    behaviour: Mutex<HashMap<NodeId, PollStatus>>,
    running: Mutex<HashMap<String, (NodeId, u32)>>,
    down: Mutex<HashSet<NodeId>>,
    pub submitted: Mutex<Vec<(TaskId, NodeId)>>,
    pub cancelled: Mutex<Vec<String>>,
    saturate_next: AtomicU32,
    unknown_timeout: Duration,
}

impl MockExecutor {
    pub fn new(name: &str, nodes: &[(&str, u32)], status: PollStatus) -> Self {
        Self {
            name: name.to_string(),
            slots: nodes.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
            behaviour: Mutex::new(
                nodes
                    .iter()
                    .map(|(n, _)| (n.to_string(), status.clone()))
                    .collect(),
            ),
            running: Mutex::new(HashMap::new()),
            down: Mutex::new(HashSet::new()),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            saturate_next: AtomicU32::new(0),
            unknown_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_unknown_timeout(mut self, t: Duration) -> Self {
        self.unknown_timeout = t;
        self
    }

    pub fn set_status(&self, node: &str, status: PollStatus) {
        self.behaviour.lock().unwrap().insert(node.to_string(), status);
    }

    pub fn set_available(&self, node: &str, up: bool) {
        let mut down = self.down.lock().unwrap();
        if up {
            down.remove(node);
        } else {
            down.insert(node.to_string());
        }
    }

    /// The next `n` submissions fail with `BackendSaturated`.
    pub fn saturate(&self, n: u32) {
        self.saturate_next.store(n, Ordering::SeqCst);
    }

    pub fn submitted_nodes(&self) -> Vec<NodeId> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        let running = self.running.lock().unwrap();
        let down = self.down.lock().unwrap();
        self.slots
            .iter()
            .map(|(id, slots)| NodeInfo {
                id: id.clone(),
                slots: *slots,
                running: running
                    .values()
                    .filter(|(n, _)| n == id)
                    .map(|(_, slots)| slots)
                    .sum(),
                available: !down.contains(id),
            })
            .collect()
    }

    async fn submit(&self, sub: &Submission, node: &NodeId) -> Result<Handle, TaskError> {
        if self
            .saturate_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TaskError::BackendSaturated {
                executor: self.name.clone(),
            });
        }
        let capacity = self
            .slots
            .iter()
            .find(|(n, _)| n == node)
            .map_or(1, |(_, s)| *s);
        let id = uuid::Uuid::new_v4().to_string();
        self.running
            .lock()
            .unwrap()
            .insert(id.clone(), (node.clone(), sub.resources.slots_on(capacity)));
        self.submitted
            .lock()
            .unwrap()
            .push((sub.task_id.clone(), node.clone()));
        Ok(Handle {
            id,
            node: node.clone(),
        })
    }

    async fn poll(&self, handle: &Handle) -> PollStatus {
        let status = self
            .behaviour
            .lock()
            .unwrap()
            .get(&handle.node)
            .cloned()
            .unwrap_or(PollStatus::Unknown);
        if matches!(status, PollStatus::Completed { .. } | PollStatus::Failed(_)) {
            self.running.lock().unwrap().remove(&handle.id);
        }
        status
    }

    async fn cancel(&self, handle: &Handle) {
        self.running.lock().unwrap().remove(&handle.id);
        self.cancelled.lock().unwrap().push(handle.id.clone());
    }

    fn unknown_timeout(&self) -> Duration {
        self.unknown_timeout
    }
}
