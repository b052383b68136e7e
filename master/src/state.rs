// master/src/state.rs

use common::{TaskEvent, TaskId, TaskView};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::executor::WorkerPool;
use crate::failover::FailoverCoordinator;
use crate::monitor::MonitorHandle;

/// Events kept for `GET /api/v1/events`; older ones are dropped.
pub const MAX_EVENTS: usize = 1000;
/// Task views kept; past this, the oldest terminal views are evicted.
pub const MAX_VIEWS: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub monitor: MonitorHandle,
    pub board: TaskBoard,
    pub coordinator: Arc<FailoverCoordinator>,
    pub workers: Arc<WorkerPool>,
}

/// Read side of the monitor: the latest view of every task plus a bounded
/// event log. Only the monitor writes here.
#[derive(Clone)]
pub struct TaskBoard {
    views: Arc<Mutex<HashMap<TaskId, TaskView>>>,
    events: Arc<Mutex<VecDeque<TaskEvent>>>,
    max_views: usize,
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::with_view_limit(MAX_VIEWS)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl TaskBoard {
    pub fn with_view_limit(max_views: usize) -> Self {
        Self {
            views: Arc::default(),
            events: Arc::default(),
            max_views,
        }
    }

    /// Active tasks are never evicted, so the map may briefly exceed the
    /// limit while they outnumber it.
    pub fn publish(&self, view: TaskView) {
        let mut views = lock(&self.views);
        views.insert(view.id.clone(), view);
        if views.len() <= self.max_views {
            return;
        }
        let oldest = views
            .values()
            .filter(|v| v.state.is_terminal())
            .min_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
            .map(|v| v.id.clone());
        if let Some(id) = oldest {
            views.remove(&id);
        }
    }

    pub fn push_event(&self, event: TaskEvent) {
        let mut events = lock(&self.events);
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn view(&self, id: &str) -> Option<TaskView> {
        lock(&self.views).get(id).cloned()
    }

    /// Sorted by last update, oldest first.
    pub fn views(&self) -> Vec<TaskView> {
        let mut views: Vec<TaskView> = lock(&self.views).values().cloned().collect();
        views.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        views
    }

    /// Events of one task, or all of them, most recent last.
    pub fn events(&self, task: Option<&str>) -> Vec<TaskEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| task.map_or(true, |t| e.task_id == t))
            .cloned()
            .collect()
    }
}
