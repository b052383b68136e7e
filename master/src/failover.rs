use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{info, warn};

use common::{FailoverStats, NodeId};

use crate::executor::NodeInfo;

/// Per-task bookkeeping: how many submissions happened and where.
#[derive(Debug, Clone, Default)]
pub struct FailoverRecord {
    attempts: u32,
    tried: Vec<NodeId>,
}

impl FailoverRecord {
    pub fn note_attempt(&mut self, node: &NodeId) {
        self.attempts += 1;
        if !self.has_tried(node) {
            self.tried.push(node.clone());
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn tried(&self) -> &[NodeId] {
        &self.tried
    }

    pub fn has_tried(&self, node: &NodeId) -> bool {
        self.tried.contains(node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverRejected {
    AttemptsExhausted { attempts: u32, max: u32 },
    NoEligibleNode { tried: usize },
}

impl fmt::Display for FailoverRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverRejected::AttemptsExhausted { attempts, max } => {
                write!(f, "{attempts} of {max} attempts used")
            }
            FailoverRejected::NoEligibleNode { tried } => {
                write!(f, "no available node left after trying {tried}")
            }
        }
    }
}

/// Decides whether a failed task may be resubmitted and where. The
/// counters only grow and are read through [`FailoverCoordinator::snapshot`].
#[derive(Debug)]
pub struct FailoverCoordinator {
    max_attempts: u32,
    failed_over: AtomicU64,
    stolen: AtomicU64,
}

impl FailoverCoordinator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            failed_over: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
        }
    }

    pub fn may_retry(&self, record: &FailoverRecord) -> Result<(), FailoverRejected> {
        if record.attempts >= self.max_attempts {
            return Err(FailoverRejected::AttemptsExhausted {
                attempts: record.attempts,
                max: self.max_attempts,
            });
        }
        Ok(())
    }

    /// Picks a node the task has not run on yet.
    pub fn failover(
        &self,
        record: &FailoverRecord,
        candidates: &[NodeInfo],
    ) -> Result<NodeId, FailoverRejected> {
        self.may_retry(record)?;

        let eligible = candidates
            .iter()
            .filter(|n| n.available && !record.has_tried(&n.id));
        let node = most_free(eligible).ok_or(FailoverRejected::NoEligibleNode {
            tried: record.tried.len(),
        })?;

        let total = self.failed_over.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "failover to node {} (attempt {} of {}, total failed over {})",
            node,
            record.attempts + 1,
            self.max_attempts,
            total
        );
        Ok(node)
    }

    /// An idle node that may take a pending task waiting for the busy
    /// `victim`. Nothing is counted until [`FailoverCoordinator::note_steal`].
    pub fn steal(
        &self,
        record: &FailoverRecord,
        victim: &NodeId,
        candidates: &[NodeInfo],
    ) -> Option<NodeId> {
        let idle = candidates
            .iter()
            .filter(|n| n.id != *victim && n.free() > 0 && !record.has_tried(&n.id));
        most_free(idle)
    }

    /// The stolen task was accepted by `thief`. Does not consume attempt
    /// budget.
    pub fn note_steal(&self, victim: &NodeId, thief: &NodeId) {
        let stolen = self.stolen.fetch_add(1, Ordering::Relaxed) + 1;
        self.failed_over.fetch_add(1, Ordering::Relaxed);
        warn!(
            "node {} stole a task waiting for {} (total stolen {})",
            thief, victim, stolen
        );
    }

    pub fn snapshot(&self) -> FailoverStats {
        FailoverStats {
            max_failover_attempts: self.max_attempts,
            total_failed_over: self.failed_over.load(Ordering::Relaxed),
            total_stolen: self.stolen.load(Ordering::Relaxed),
        }
    }
}

// Most free slots wins; ties go to the first listed.
pub(crate) fn most_free<'a>(nodes: impl Iterator<Item = &'a NodeInfo>) -> Option<NodeId> {
    let mut best: Option<&NodeInfo> = None;
    for n in nodes {
        if best.map_or(true, |b| n.free() > b.free()) {
            best = Some(n);
        }
    }
    best.map(|n| n.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, slots: u32, running: u32) -> NodeInfo {
        NodeInfo {
            id: id.into(),
            slots,
            running,
            available: true,
        }
    }

    fn four_nodes() -> Vec<NodeInfo> {
        ["A", "B", "C", "D"].iter().map(|id| node(id, 1, 0)).collect()
    }

    #[test]
    fn node_lost_on_every_attempt() {
        let coord = FailoverCoordinator::new(3);
        let nodes = four_nodes();
        let mut record = FailoverRecord::default();

        record.note_attempt(&"A".to_string());
        let second = coord.failover(&record, &nodes).unwrap();
        assert_eq!(second, "B");
        record.note_attempt(&second);

        let third = coord.failover(&record, &nodes).unwrap();
        assert_eq!(third, "C");
        record.note_attempt(&third);

        assert_eq!(
            coord.failover(&record, &nodes),
            Err(FailoverRejected::AttemptsExhausted { attempts: 3, max: 3 })
        );
        assert_eq!(record.tried(), ["A", "B", "C"]);
        assert_eq!(coord.snapshot().total_failed_over, 2);
    }

    #[test]
    fn prefers_most_free_untried_node() {
        let coord = FailoverCoordinator::new(5);
        let nodes = vec![node("A", 4, 0), node("B", 2, 1), node("C", 4, 1), node("D", 4, 1)];
        let mut record = FailoverRecord::default();
        record.note_attempt(&"A".to_string());

        assert_eq!(coord.failover(&record, &nodes).unwrap(), "C");
    }

    #[test]
    fn no_untried_node_left() {
        let coord = FailoverCoordinator::new(5);
        let mut nodes = vec![node("A", 1, 0), node("B", 1, 0)];
        nodes[1].available = false;
        let mut record = FailoverRecord::default();
        record.note_attempt(&"A".to_string());

        assert_eq!(
            coord.failover(&record, &nodes),
            Err(FailoverRejected::NoEligibleNode { tried: 1 })
        );
        assert_eq!(coord.snapshot().total_failed_over, 0);
    }

    #[test]
    fn steal_counts_in_both_totals() {
        let coord = FailoverCoordinator::new(2);
        let nodes = vec![node("A", 1, 1), node("B", 1, 0)];
        let record = FailoverRecord::default();

        let thief = coord.steal(&record, &"A".to_string(), &nodes).unwrap();
        assert_eq!(thief, "B");
        // picking a thief alone counts nothing
        assert_eq!(coord.snapshot().total_stolen, 0);

        coord.note_steal(&"A".to_string(), &thief);
        assert_eq!(
            coord.snapshot(),
            FailoverStats {
                max_failover_attempts: 2,
                total_failed_over: 1,
                total_stolen: 1,
            }
        );
        // the record is untouched, so the attempt budget is intact
        assert!(coord.may_retry(&record).is_ok());
    }

    #[test]
    fn steal_needs_an_idle_untried_node() {
        let coord = FailoverCoordinator::new(5);
        let nodes = vec![node("A", 1, 1), node("B", 1, 0)];
        let mut record = FailoverRecord::default();
        record.note_attempt(&"B".to_string());

        assert_eq!(coord.steal(&record, &"A".to_string(), &nodes), None);
        assert_eq!(coord.snapshot().total_stolen, 0);
    }

    #[test]
    fn repeated_node_counts_once_in_tried() {
        let mut record = FailoverRecord::default();
        record.note_attempt(&"A".to_string());
        record.note_attempt(&"A".to_string());
        assert_eq!(record.attempts(), 2);
        assert_eq!(record.tried(), ["A"]);
    }
}
