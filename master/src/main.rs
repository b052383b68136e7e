mod executor;
mod failover;
mod handlers;
mod monitor;
mod state;

use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{EngineConfig, ExecutorKind, TaskOutcome, WorkDirManager};

use crate::executor::{Executor, LocalExecutor, WorkerPool};
use crate::failover::FailoverCoordinator;
use crate::monitor::{Monitor, MonitorHandle, MonitorSettings};
use crate::state::{AppState, TaskBoard};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,common=debug,axum=info")),
        )
        .init();

    let cfg = EngineConfig::load()?;
    std::fs::create_dir_all(&cfg.work_dir)
        .with_context(|| format!("creating work dir {}", cfg.work_dir.display()))?;
    info!(
        "engine config: work_dir={} max_failover_attempts={} resume={}",
        cfg.work_dir.display(),
        cfg.max_failover_attempts,
        cfg.resume
    );

    // Only one worker pool is reachable over HTTP; extra entries share it.
    let mut pool: Option<Arc<WorkerPool>> = None;
    let mut executors: Vec<Arc<dyn Executor>> = Vec::new();
    for e in &cfg.executors {
        let unknown_timeout = Duration::from_secs(e.unknown_timeout_secs);
        match e.kind {
            ExecutorKind::Local => {
                executors.push(Arc::new(LocalExecutor::new(&e.name, e.concurrency, unknown_timeout)));
            }
            ExecutorKind::Workers => {
                if pool.is_some() {
                    warn!("executor {} ignored: a worker pool is already configured", e.name);
                    continue;
                }
                let p = Arc::new(WorkerPool::new(&e.name, unknown_timeout));
                executors.push(p.clone());
                pool = Some(p);
            }
        }
    }
    let workers = pool.unwrap_or_else(|| Arc::new(WorkerPool::new("workers", Duration::from_secs(30))));

    let (handle, commands) = MonitorHandle::channel();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let board = TaskBoard::default();
    let coordinator = Arc::new(FailoverCoordinator::new(cfg.max_failover_attempts));

    let monitor = Monitor::new(
        MonitorSettings::from_config(&cfg),
        executors,
        Arc::new(WorkDirManager::new(&cfg.work_dir)),
        coordinator.clone(),
        board.clone(),
        commands,
        outcome_tx,
    );
    tokio::spawn(monitor.run());

    // heartbeat sweep in the background
    tokio::spawn(executor::run_sweep_loop(workers.clone()));
    tokio::spawn(log_outcomes(outcome_rx));

    let state = AppState {
        monitor: handle,
        board,
        coordinator,
        workers,
    };
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    info!("master listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn log_outcomes(mut rx: mpsc::UnboundedReceiver<TaskOutcome>) {
    while let Some(outcome) = rx.recv().await {
        match &outcome {
            TaskOutcome::Completed { name, outputs, cached, .. } => info!(
                "outcome: {} COMPLETED ({} output group(s){})",
                name,
                outputs.len(),
                if *cached { ", cached" } else { "" }
            ),
            TaskOutcome::Failed { name, cause, work_dir, .. } => warn!(
                "outcome: {} FAILED in {:?}: {}",
                name, work_dir, cause
            ),
            TaskOutcome::Ignored { name, cause, .. } => {
                info!("outcome: {} IGNORED: {}", name, cause)
            }
            TaskOutcome::Aborted { name, .. } => info!("outcome: {} ABORTED", name),
        }
    }
}
