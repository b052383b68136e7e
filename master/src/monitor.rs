//! Task monitor: the only writer of task state.
//!
//! Every tick drains submit/abort commands, polls all in-flight handles
//! concurrently, applies the results one by one and then admits pending
//! tasks onto nodes with free slots. Executor calls run on spawned tasks
//! under a timeout; directory work and output collection run on the
//! blocking pool.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use common::output::collect_outputs;
use common::workdir::identity;
use common::{
    AttemptRecord, Disposition, EngineConfig, ErrorStrategy, NodeId, ResolvedOutput,
    SubmitResponse, TaskDescriptor, TaskError, TaskEvent, TaskId, TaskOutcome, TaskState,
    TaskView, WorkDirManager,
};

use crate::executor::{Executor, Handle, NodeInfo, PollStatus, Submission};
use crate::failover::{most_free, FailoverCoordinator, FailoverRecord, FailoverRejected};
use crate::state::TaskBoard;

pub enum MonitorCommand {
    Submit {
        task: TaskDescriptor,
        reply: oneshot::Sender<Result<SubmitResponse, SubmitError>>,
    },
    Abort {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
}

/// Commands buffered before callers of [`MonitorHandle`] wait.
pub const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// A TERMINATE or FINISH failure stopped the run.
    Halted,
    UnknownExecutor(String),
    /// Too many tasks of this executor are waiting for a slot.
    QueueFull { executor: String, limit: usize },
    /// The monitor loop is gone.
    Stopped,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Halted => f.write_str("run halted, no new submissions accepted"),
            SubmitError::UnknownExecutor(name) => write!(f, "unknown executor `{name}`"),
            SubmitError::QueueFull { executor, limit } => {
                write!(f, "executor `{executor}` already has {limit} task(s) waiting")
            }
            SubmitError::Stopped => f.write_str("task monitor is not running"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Sending side of the monitor's command channel.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    pub fn channel() -> (Self, mpsc::Receiver<MonitorCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        (Self { tx }, rx)
    }

    pub async fn submit(&self, task: TaskDescriptor) -> Result<SubmitResponse, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MonitorCommand::Submit { task, reply })
            .await
            .map_err(|_| SubmitError::Stopped)?;
        rx.await.map_err(|_| SubmitError::Stopped)?
    }

    /// `true` when the task was active and is now aborted.
    pub async fn abort(&self, id: TaskId) -> Result<bool, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MonitorCommand::Abort { id, reply })
            .await
            .map_err(|_| SubmitError::Stopped)?;
        rx.await.map_err(|_| SubmitError::Stopped)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub default_max_retries: u32,
    pub resume: bool,
    pub default_executor: String,
    /// Waiting tasks allowed per executor; absent means unbounded.
    pub queue_limits: HashMap<String, usize>,
}

impl MonitorSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            call_timeout: cfg.call_timeout(),
            default_max_retries: cfg.default_max_retries,
            resume: cfg.resume,
            default_executor: cfg.default_executor.clone(),
            queue_limits: cfg
                .executors
                .iter()
                .map(|e| (e.name.clone(), e.max_queued))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Terminate,
    Finish,
}

struct TaskEntry {
    id: TaskId,
    task: Arc<TaskDescriptor>,
    executor: String,
    work_dir: Option<PathBuf>,
    state: TaskState,
    retries: u32,
    failover: FailoverRecord,
    /// Node chosen by failover for the next submission.
    target: Option<NodeId>,
    handle: Option<Handle>,
    unknown_since: Option<Instant>,
    history: Vec<AttemptRecord>,
    outputs: Vec<ResolvedOutput>,
    error: Option<String>,
    cached: bool,
    updated_at: DateTime<Utc>,
}

impl TaskEntry {
    fn new(id: TaskId, task: TaskDescriptor, executor: String) -> Self {
        Self {
            id,
            task: Arc::new(task),
            executor,
            work_dir: None,
            state: TaskState::New,
            retries: 0,
            failover: FailoverRecord::default(),
            target: None,
            handle: None,
            unknown_since: None,
            history: Vec::new(),
            outputs: Vec::new(),
            error: None,
            cached: false,
            updated_at: Utc::now(),
        }
    }

    fn in_flight(&self) -> bool {
        matches!(self.state, TaskState::Submitted | TaskState::Running)
    }

    fn close_attempt(&mut self, result: String) {
        if let Some(last) = self.history.last_mut() {
            if last.finished_at.is_none() {
                last.finished_at = Some(Utc::now());
                last.result = Some(result);
            }
        }
    }

    fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            name: self.task.name.clone(),
            state: self.state,
            executor: self.executor.clone(),
            work_dir: self.work_dir.clone(),
            attempts: self.failover.attempts(),
            nodes_tried: self.failover.tried().to_vec(),
            history: self.history.clone(),
            outputs: self.outputs.clone(),
            error: self.error.clone(),
            cached: self.cached,
            updated_at: self.updated_at,
        }
    }
}

enum Prepared {
    Fresh(PathBuf),
    Cached(PathBuf, Vec<ResolvedOutput>),
}

enum Placement {
    Node(NodeId),
    /// Taken from the busy node it waited for.
    Stolen { thief: NodeId, victim: NodeId },
    Wait,
    Impossible(FailoverRejected),
}

pub struct Monitor {
    settings: MonitorSettings,
    executors: HashMap<String, Arc<dyn Executor>>,
    workdirs: Arc<WorkDirManager>,
    coordinator: Arc<FailoverCoordinator>,
    board: TaskBoard,
    commands: mpsc::Receiver<MonitorCommand>,
    outcomes: mpsc::UnboundedSender<TaskOutcome>,
    /// Active tasks only; terminal ones live on in the board.
    tasks: HashMap<TaskId, TaskEntry>,
    queues: HashMap<String, VecDeque<TaskId>>,
    halt: Option<Halt>,
    commands_closed: bool,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        executors: Vec<Arc<dyn Executor>>,
        workdirs: Arc<WorkDirManager>,
        coordinator: Arc<FailoverCoordinator>,
        board: TaskBoard,
        commands: mpsc::Receiver<MonitorCommand>,
        outcomes: mpsc::UnboundedSender<TaskOutcome>,
    ) -> Self {
        Self {
            settings,
            executors: executors
                .into_iter()
                .map(|e| (e.name().to_string(), e))
                .collect(),
            workdirs,
            coordinator,
            board,
            commands,
            outcomes,
            tasks: HashMap::new(),
            queues: HashMap::new(),
            halt: None,
            commands_closed: false,
        }
    }

    /// Ticks until the command channel is closed and every task is done.
    pub async fn run(mut self) {
        info!(
            "task monitor started (poll every {:?}, executors: {:?})",
            self.settings.poll_interval,
            self.executors.keys().collect::<Vec<_>>()
        );
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
            if self.commands_closed && self.tasks.is_empty() {
                info!("task monitor drained, stopping");
                break;
            }
        }
    }

    pub async fn tick(&mut self) {
        self.drain_commands().await;
        self.poll_in_flight().await;
        self.admit_pending().await;
    }

    /* ---------------- commands ---------------- */

    async fn drain_commands(&mut self) {
        let mut fresh = Vec::new();
        loop {
            match self.commands.try_recv() {
                Ok(MonitorCommand::Submit { task, reply }) => {
                    let result = self.accept(task, &mut fresh);
                    let _ = reply.send(result);
                }
                Ok(MonitorCommand::Abort { id, reply }) => {
                    let found = self.tasks.contains_key(&id);
                    if found {
                        self.finish_aborted(&id, "aborted on request".into());
                    }
                    let _ = reply.send(found);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.commands_closed {
                        debug!("command channel closed");
                    }
                    self.commands_closed = true;
                    break;
                }
            }
        }
        if !fresh.is_empty() {
            self.prepare(fresh).await;
        }
    }

    fn accept(
        &mut self,
        task: TaskDescriptor,
        fresh: &mut Vec<TaskId>,
    ) -> Result<SubmitResponse, SubmitError> {
        if self.halt.is_some() {
            return Err(SubmitError::Halted);
        }
        let executor = task
            .executor
            .clone()
            .unwrap_or_else(|| self.settings.default_executor.clone());
        if !self.executors.contains_key(&executor) {
            return Err(SubmitError::UnknownExecutor(executor));
        }

        let id = identity(&task);
        if self.tasks.contains_key(&id) {
            debug!("task {} already active, not queued again", id);
            return Ok(SubmitResponse { id, duplicate: true });
        }
        if let Some(&limit) = self.settings.queue_limits.get(&executor) {
            let waiting = self
                .tasks
                .values()
                .filter(|e| e.executor == executor && e.state == TaskState::New)
                .count();
            if waiting >= limit {
                warn!("executor {} queue is full ({} waiting)", executor, waiting);
                return Err(SubmitError::QueueFull { executor, limit });
            }
        }

        info!("task {} ({}) accepted for executor {}", task.name, id, executor);
        self.tasks
            .insert(id.clone(), TaskEntry::new(id.clone(), task, executor));
        self.transition(&id, TaskState::New, None);
        fresh.push(id.clone());
        Ok(SubmitResponse {
            id,
            duplicate: false,
        })
    }

    async fn prepare(&mut self, fresh: Vec<TaskId>) {
        let resume = self.settings.resume;
        let jobs: Vec<(TaskId, Arc<TaskDescriptor>)> = fresh
            .into_iter()
            .filter_map(|id| self.tasks.get(&id).map(|e| (id, e.task.clone())))
            .collect();

        let calls = jobs.iter().map(|(id, task)| {
            let (id, task, workdirs) = (id.clone(), task.clone(), self.workdirs.clone());
            tokio::task::spawn_blocking(move || prepare_dir(&workdirs, &id, &task, resume))
        });
        let results = join_all(calls).await;

        for ((id, _), joined) in jobs.into_iter().zip(results) {
            let prepared = joined.unwrap_or_else(|e| {
                Err(TaskError::Backend(format!("work dir preparation panicked: {e}")))
            });
            match prepared {
                Ok(Prepared::Fresh(dir)) => {
                    let Some(entry) = self.tasks.get_mut(&id) else {
                        continue;
                    };
                    entry.work_dir = Some(dir);
                    self.queues
                        .entry(entry.executor.clone())
                        .or_default()
                        .push_back(id.clone());
                    self.board.publish(entry.view());
                }
                Ok(Prepared::Cached(dir, outputs)) => {
                    let Some(entry) = self.tasks.get_mut(&id) else {
                        continue;
                    };
                    info!("task {} ({}) resumed from cache", entry.task.name, id);
                    entry.work_dir = Some(dir);
                    entry.outputs = outputs;
                    entry.cached = true;
                    self.finish_completed(&id);
                }
                Err(e) => self.handle_failure(&id, e),
            }
        }
    }

    /* ---------------- polling ---------------- */

    async fn poll_in_flight(&mut self) {
        let in_flight: Vec<(TaskId, Arc<dyn Executor>, Handle)> = self
            .tasks
            .values()
            .filter_map(|e| {
                let handle = e.handle.clone()?;
                let exec = self.executors.get(&e.executor)?.clone();
                Some((e.id.clone(), exec, handle))
            })
            .collect();
        if in_flight.is_empty() {
            return;
        }

        let call_timeout = self.settings.call_timeout;
        let polls = in_flight.iter().map(|(_, exec, handle)| {
            let (exec, handle) = (exec.clone(), handle.clone());
            tokio::spawn(async move {
                timeout(call_timeout, exec.poll(&handle))
                    .await
                    .unwrap_or(PollStatus::Unknown)
            })
        });
        let results = join_all(polls).await;

        let mut finished = Vec::new();
        for ((id, exec, _), joined) in in_flight.into_iter().zip(results) {
            let status = joined.unwrap_or_else(|e| {
                warn!("poll of {} panicked: {}", id, e);
                PollStatus::Unknown
            });
            if self.apply_status(&id, &exec, status) {
                finished.push(id);
            }
        }
        if !finished.is_empty() {
            self.collect_finished(finished).await;
        }
    }

    /// Returns `true` when the script succeeded and outputs must be collected.
    fn apply_status(&mut self, id: &str, exec: &Arc<dyn Executor>, status: PollStatus) -> bool {
        let Some(entry) = self.tasks.get_mut(id) else {
            return false;
        };
        if entry.handle.is_none() {
            return false;
        }

        match status {
            PollStatus::Pending => {
                entry.unknown_since = None;
                false
            }
            PollStatus::Running => {
                entry.unknown_since = None;
                if entry.state == TaskState::Submitted {
                    self.transition(id, TaskState::Running, None);
                }
                false
            }
            PollStatus::Unknown => {
                let since = *entry.unknown_since.get_or_insert_with(Instant::now);
                let limit = exec.unknown_timeout();
                if since.elapsed() < limit {
                    debug!("task {} status unknown for {:?}", id, since.elapsed());
                    return false;
                }
                if let Some(handle) = entry.handle.take() {
                    let node = handle.node.clone();
                    self.cancel_detached(exec.clone(), handle);
                    self.handle_failure(
                        id,
                        TaskError::StatusLost {
                            node,
                            secs: limit.as_secs(),
                        },
                    );
                }
                false
            }
            PollStatus::Completed { exit_code: 0 } => {
                entry.handle = None;
                entry.unknown_since = None;
                true
            }
            PollStatus::Completed { exit_code } => {
                self.handle_failure(id, TaskError::ScriptFailed { exit_code });
                false
            }
            PollStatus::Failed(cause) => {
                self.handle_failure(id, cause.into());
                false
            }
        }
    }

    async fn collect_finished(&mut self, ids: Vec<TaskId>) {
        let jobs: Vec<(TaskId, Arc<TaskDescriptor>, PathBuf)> = ids
            .into_iter()
            .filter_map(|id| {
                let e = self.tasks.get(&id)?;
                Some((id, e.task.clone(), e.work_dir.clone()?))
            })
            .collect();

        let calls = jobs.iter().map(|(_, task, dir)| {
            let (task, dir) = (task.clone(), dir.clone());
            tokio::task::spawn_blocking(move || {
                collect_outputs(
                    &task.outputs,
                    &task.staged_context(),
                    &dir,
                    &task.staged_names(),
                )
            })
        });
        let results = join_all(calls).await;

        for ((id, _, _), joined) in jobs.into_iter().zip(results) {
            let collected = joined.unwrap_or_else(|e| {
                Err(TaskError::Backend(format!("output collection panicked: {e}")))
            });
            match collected {
                Ok(outputs) => {
                    if let Some(entry) = self.tasks.get_mut(&id) {
                        entry.outputs = outputs;
                        self.finish_completed(&id);
                    }
                }
                Err(e) => self.handle_failure(&id, e),
            }
        }
    }

    /* ---------------- failures ---------------- */

    fn handle_failure(&mut self, id: &str, err: TaskError) {
        let Some(entry) = self.tasks.get_mut(id) else {
            return;
        };
        let cause = err.to_string();
        entry.close_attempt(cause.clone());
        entry.handle = None;
        entry.unknown_since = None;
        entry.error = Some(cause.clone());

        let disposition = err.disposition();
        let record = entry.failover.clone();
        let executor = entry.executor.clone();
        let strategy = entry.task.error_strategy;
        let max_retries = entry
            .task
            .max_retries
            .unwrap_or(self.settings.default_max_retries);
        let retries = entry.retries;
        let new_node = entry.task.retry_on_new_node;
        warn!(
            "task {} ({}) attempt {} failed: {}",
            entry.task.name,
            id,
            record.attempts(),
            cause
        );

        match disposition {
            Disposition::Fatal => self.finish_failed(id, cause),
            Disposition::Requeue => self.requeue(id, None, &cause),
            Disposition::Failover => {
                if self.halt.is_some() {
                    return self.finish_failed(id, cause);
                }
                match self.coordinator.failover(&record, &self.candidates(&executor)) {
                    Ok(node) => self.requeue(id, Some(node), &cause),
                    Err(rej) => self.finish_failed(id, exhausted(&record, &rej, &cause)),
                }
            }
            Disposition::TaskFailure => match strategy {
                ErrorStrategy::Ignore => self.finish_ignored(id, cause),
                ErrorStrategy::Terminate => {
                    self.finish_failed(id, cause);
                    self.halt(Halt::Terminate);
                }
                ErrorStrategy::Finish => {
                    self.finish_failed(id, cause);
                    self.halt(Halt::Finish);
                }
                ErrorStrategy::Retry => {
                    if self.halt.is_some() || retries >= max_retries {
                        return self.finish_failed(id, cause);
                    }
                    let target = if new_node {
                        self.coordinator
                            .failover(&record, &self.candidates(&executor))
                            .map(Some)
                    } else {
                        self.coordinator.may_retry(&record).map(|_| None)
                    };
                    match target {
                        Ok(target) => {
                            if let Some(entry) = self.tasks.get_mut(id) {
                                entry.retries += 1;
                            }
                            self.requeue(id, target, &cause);
                        }
                        Err(rej) => self.finish_failed(id, exhausted(&record, &rej, &cause)),
                    }
                }
            },
        }
    }

    fn candidates(&self, executor: &str) -> Vec<NodeInfo> {
        self.executors
            .get(executor)
            .map(|e| e.nodes())
            .unwrap_or_default()
    }

    fn requeue(&mut self, id: &str, target: Option<NodeId>, cause: &str) {
        let Some(entry) = self.tasks.get_mut(id) else {
            return;
        };
        let detail = match &target {
            Some(node) => format!("resubmitting on {node} after: {cause}"),
            None => format!("retrying after: {cause}"),
        };
        entry.target = target;
        self.queues
            .entry(entry.executor.clone())
            .or_default()
            .push_back(id.to_string());
        self.transition(id, TaskState::New, Some(detail));
    }

    fn halt(&mut self, kind: Halt) {
        match self.halt {
            Some(Halt::Terminate) => return,
            Some(Halt::Finish) if kind == Halt::Finish => return,
            _ => {}
        }
        self.halt = Some(kind);
        warn!("run halted ({:?}), no new submissions accepted", kind);

        let victims: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|e| kind == Halt::Terminate || !e.in_flight())
            .map(|e| e.id.clone())
            .collect();
        for id in victims {
            self.finish_aborted(&id, format!("run halted ({kind:?})"));
        }
    }

    /* ---------------- admission ---------------- */

    async fn admit_pending(&mut self) {
        if self.halt.is_some() {
            return;
        }

        let mut launches: Vec<Launch> = Vec::new();
        let mut impossible = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            let Some(exec) = self.executors.get(name) else {
                continue;
            };
            // local copy, so slots taken in this pass are accounted for
            let mut nodes = exec.nodes();
            let mut waiting = VecDeque::with_capacity(queue.len());

            while let Some(id) = queue.pop_front() {
                let Some(entry) = self.tasks.get(&id) else {
                    continue;
                };
                let (node, stolen_from) = match place(entry, &nodes, &self.coordinator) {
                    Placement::Node(node) => (node, None),
                    Placement::Stolen { thief, victim } => (thief, Some(victim)),
                    Placement::Wait => {
                        waiting.push_back(id);
                        continue;
                    }
                    Placement::Impossible(rej) => {
                        impossible.push((id, rej));
                        continue;
                    }
                };
                if let Some(n) = nodes.iter_mut().find(|n| n.id == node) {
                    n.running += entry.task.resources.slots_on(n.slots);
                }
                let sub = Submission {
                    task_id: id.clone(),
                    name: entry.task.name.clone(),
                    work_dir: entry.work_dir.clone().unwrap_or_default(),
                    resources: entry.task.resources.clone(),
                    attempt: entry.failover.attempts() + 1,
                };
                launches.push(Launch {
                    id,
                    exec: exec.clone(),
                    node,
                    stolen_from,
                    sub,
                });
            }
            *queue = waiting;
        }

        for (id, rej) in impossible {
            let cause = self
                .tasks
                .get(&id)
                .and_then(|e| e.error.clone())
                .unwrap_or_default();
            let record = match self.tasks.get(&id) {
                Some(e) => e.failover.clone(),
                None => continue,
            };
            self.finish_failed(&id, exhausted(&record, &rej, &cause));
        }
        if launches.is_empty() {
            return;
        }

        let call_timeout = self.settings.call_timeout;
        let calls = launches.iter().map(|l| {
            let (exec, node, sub) = (l.exec.clone(), l.node.clone(), l.sub.clone());
            let workdirs = self.workdirs.clone();
            tokio::spawn(async move {
                let dir = sub.work_dir.clone();
                match tokio::task::spawn_blocking(move || workdirs.reset_attempt(&dir)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(TaskError::Backend(e.to_string())),
                }
                let submitted = timeout(call_timeout, exec.submit(&sub, &node)).await;
                submitted.unwrap_or_else(|_| Err(TaskError::NodeUnavailable { node }))
            })
        });
        let results = join_all(calls).await;

        let mut saturated = Vec::new();
        for (launch, joined) in launches.into_iter().zip(results) {
            let result = joined.unwrap_or_else(|e| {
                Err(TaskError::Backend(format!("submit panicked: {e}")))
            });
            match result {
                Err(e) if e.disposition() == Disposition::Requeue => {
                    debug!("task {} not submitted: {}", launch.id, e);
                    saturated.push((launch.exec.name().to_string(), launch.id));
                }
                other => self.apply_submit(launch, other),
            }
        }
        // back to the head of the queue, original order kept
        for (executor, id) in saturated.into_iter().rev() {
            self.queues.entry(executor).or_default().push_front(id);
        }
    }

    fn apply_submit(&mut self, launch: Launch, result: Result<Handle, TaskError>) {
        let Launch {
            id,
            exec,
            node,
            stolen_from,
            ..
        } = launch;
        let id = id.as_str();
        let Some(entry) = self.tasks.get_mut(id) else {
            return;
        };
        entry.failover.note_attempt(&node);
        entry.history.push(AttemptRecord {
            attempt: entry.failover.attempts(),
            executor: exec.name().to_string(),
            node: node.clone(),
            submitted_at: Utc::now(),
            finished_at: None,
            result: None,
        });
        match result {
            Ok(handle) => {
                entry.handle = Some(handle);
                entry.target = None;
                entry.unknown_since = None;
                if let Some(victim) = &stolen_from {
                    self.coordinator.note_steal(victim, &node);
                }
                self.transition(id, TaskState::Submitted, Some(format!("on node {node}")));
            }
            Err(e) => self.handle_failure(id, e),
        }
    }

    /* ---------------- terminal states ---------------- */

    fn transition(&mut self, id: &str, state: TaskState, detail: Option<String>) {
        let Some(entry) = self.tasks.get_mut(id) else {
            return;
        };
        entry.state = state;
        entry.updated_at = Utc::now();
        emit(&self.board, entry, detail);
    }

    fn retire(&mut self, id: &str, state: TaskState, detail: Option<String>) -> Option<TaskEntry> {
        let mut entry = self.tasks.remove(id)?;
        if let Some(queue) = self.queues.get_mut(&entry.executor) {
            queue.retain(|q| q != id);
        }
        entry.state = state;
        entry.updated_at = Utc::now();
        emit(&self.board, &entry, detail);
        Some(entry)
    }

    fn send(&self, outcome: TaskOutcome) {
        if self.outcomes.send(outcome).is_err() {
            debug!("outcome receiver dropped");
        }
    }

    fn finish_completed(&mut self, id: &str) {
        if let Some(entry) = self.tasks.get_mut(id) {
            entry.close_attempt("COMPLETED".into());
            entry.error = None;
        }
        let Some(entry) = self.retire(id, TaskState::Completed, None) else {
            return;
        };
        info!(
            "task {} ({}) completed{}",
            entry.task.name,
            id,
            if entry.cached { " from cache" } else { "" }
        );
        self.send(TaskOutcome::Completed {
            id: entry.id,
            name: entry.task.name.clone(),
            work_dir: entry.work_dir.unwrap_or_default(),
            outputs: entry.outputs,
            cached: entry.cached,
        });
    }

    fn finish_failed(&mut self, id: &str, cause: String) {
        if let Some(entry) = self.tasks.get_mut(id) {
            entry.error = Some(cause.clone());
        }
        let Some(entry) = self.retire(id, TaskState::Failed, Some(cause.clone())) else {
            return;
        };
        warn!(
            "task {} ({}) FAILED after {} attempt(s) on {:?}: {}",
            entry.task.name,
            id,
            entry.failover.attempts(),
            entry.failover.tried(),
            cause
        );
        self.send(TaskOutcome::Failed {
            id: entry.id,
            name: entry.task.name.clone(),
            work_dir: entry.work_dir,
            cause,
            history: entry.history,
        });
    }

    fn finish_ignored(&mut self, id: &str, cause: String) {
        let Some(entry) = self.retire(id, TaskState::Ignored, Some(cause.clone())) else {
            return;
        };
        info!("task {} ({}) failed, ignored: {}", entry.task.name, id, cause);
        self.send(TaskOutcome::Ignored {
            id: entry.id,
            name: entry.task.name.clone(),
            work_dir: entry.work_dir,
            cause,
        });
    }

    fn finish_aborted(&mut self, id: &str, reason: String) {
        let handle = self.tasks.get_mut(id).and_then(|e| {
            e.close_attempt(reason.clone());
            let exec = self.executors.get(&e.executor)?.clone();
            Some((exec, e.handle.take()?))
        });
        if let Some((exec, handle)) = handle {
            self.cancel_detached(exec, handle);
        }
        let Some(entry) = self.retire(id, TaskState::Aborted, Some(reason)) else {
            return;
        };
        info!("task {} ({}) aborted", entry.task.name, id);
        self.send(TaskOutcome::Aborted {
            id: entry.id,
            name: entry.task.name.clone(),
        });
    }

    // Fire and forget; the outcome of a cancel is never awaited.
    fn cancel_detached(&self, exec: Arc<dyn Executor>, handle: Handle) {
        let call_timeout = self.settings.call_timeout;
        tokio::spawn(async move {
            if timeout(call_timeout, exec.cancel(&handle)).await.is_err() {
                warn!("cancel of {} on {} timed out", handle.id, handle.node);
            }
        });
    }
}

fn emit(board: &TaskBoard, entry: &TaskEntry, detail: Option<String>) {
    debug!("task {} ({}) -> {}", entry.task.name, entry.id, entry.state);
    board.push_event(TaskEvent {
        task_id: entry.id.clone(),
        name: entry.task.name.clone(),
        state: entry.state,
        attempt: entry.failover.attempts(),
        node: entry.history.last().map(|a| a.node.clone()),
        detail,
        at: entry.updated_at,
    });
    board.publish(entry.view());
}

fn exhausted(record: &FailoverRecord, rej: &FailoverRejected, cause: &str) -> String {
    TaskError::FailoverExhausted {
        attempts: record.attempts(),
        reason: format!("{rej}; last error: {cause}"),
    }
    .to_string()
}

fn prepare_dir(
    workdirs: &WorkDirManager,
    id: &str,
    task: &TaskDescriptor,
    resume: bool,
) -> Result<Prepared, TaskError> {
    let dir = workdirs.allocate(id)?;
    if resume && workdirs.is_cached(id) {
        match collect_outputs(
            &task.outputs,
            &task.staged_context(),
            &dir,
            &task.staged_names(),
        ) {
            Ok(outputs) => return Ok(Prepared::Cached(dir, outputs)),
            Err(e) => debug!("cached run of {} not reusable: {}", id, e),
        }
    }
    workdirs.prepare(&dir, task)?;
    Ok(Prepared::Fresh(dir))
}

struct Launch {
    id: TaskId,
    exec: Arc<dyn Executor>,
    node: NodeId,
    stolen_from: Option<NodeId>,
    sub: Submission,
}

fn untried_with_room<'a>(
    entry: &'a TaskEntry,
    nodes: &'a [NodeInfo],
) -> impl Iterator<Item = &'a NodeInfo> + 'a {
    nodes
        .iter()
        .filter(move |n| n.fits(&entry.task.resources) && !entry.failover.has_tried(&n.id))
}

fn place(entry: &TaskEntry, nodes: &[NodeInfo], coordinator: &FailoverCoordinator) -> Placement {
    let resources = &entry.task.resources;

    if let Some(target) = &entry.target {
        let wanted = nodes.iter().find(|n| n.id == *target && n.available);
        if let Some(wanted) = wanted {
            if wanted.fits(resources) {
                return Placement::Node(target.clone());
            }
            let roomy: Vec<NodeInfo> = nodes.iter().filter(|n| n.fits(resources)).cloned().collect();
            return match coordinator.steal(&entry.failover, target, &roomy) {
                Some(thief) => Placement::Stolen {
                    thief,
                    victim: target.clone(),
                },
                None => Placement::Wait,
            };
        }

        // the failover target went away: any untried node honours it
        if let Some(node) = most_free(untried_with_room(entry, nodes)) {
            return Placement::Node(node);
        }
        let any_untried = nodes
            .iter()
            .any(|n| n.available && !entry.failover.has_tried(&n.id));
        if !any_untried {
            return Placement::Impossible(FailoverRejected::NoEligibleNode {
                tried: entry.failover.tried().len(),
            });
        }
        return Placement::Wait;
    }

    // untried nodes first, then any node with room
    match most_free(untried_with_room(entry, nodes))
        .or_else(|| most_free(nodes.iter().filter(|n| n.fits(resources))))
    {
        Some(node) => Placement::Node(node),
        None => Placement::Wait,
    }
}
