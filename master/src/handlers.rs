use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    AssignmentComplete, AssignmentCompleteResponse, AssignmentRequest, AssignmentResponse,
    FailoverStats, SubmitResponse, TaskDescriptor, TaskEvent, TaskView,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::monitor::SubmitError;
use crate::state::AppState;

type ApiError = (StatusCode, String);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(submit_task).get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/abort", post(abort_task))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/failover", get(failover_stats))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/assignments/next", post(next_assignment))
        .route("/api/v1/assignments/complete", post(complete_assignment))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- tasks ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn submit_task(
    State(state): State<AppState>,
    Json(task): Json<TaskDescriptor>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let name = task.name.clone();
    match state.monitor.submit(task).await {
        Ok(resp) => {
            info!("task {} submitted as {} (duplicate={})", name, resp.id, resp.duplicate);
            Ok(Json(resp))
        }
        Err(e @ SubmitError::Halted) => Err((StatusCode::CONFLICT, e.to_string())),
        Err(e @ SubmitError::UnknownExecutor(_)) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        Err(e @ SubmitError::QueueFull { .. }) => {
            Err((StatusCode::TOO_MANY_REQUESTS, e.to_string()))
        }
        Err(e @ SubmitError::Stopped) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskView>> {
    Json(state.board.views())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, StatusCode> {
    state.board.view(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AbortResponse {
    pub aborted: bool,
}

async fn abort_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AbortResponse>, ApiError> {
    match state.monitor.abort(id).await {
        Ok(true) => Ok(Json(AbortResponse { aborted: true })),
        Ok(false) => Err((StatusCode::NOT_FOUND, "task is not active".into())),
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    task: Option<String>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Json<Vec<TaskEvent>> {
    Json(state.board.events(q.task.as_deref()))
}

async fn failover_stats(State(state): State<AppState>) -> Json<FailoverStats> {
    Json(state.coordinator.snapshot())
}

/* ---------------- worker protocol ---------------- */

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    Json(state.workers.metrics())
}

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = state.workers.register(req);
    Json(WorkerRegisterResponse { worker_id })
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    state
        .workers
        .heartbeat(req)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn next_assignment(
    State(state): State<AppState>,
    Json(req): Json<AssignmentRequest>,
) -> Json<AssignmentResponse> {
    Json(AssignmentResponse {
        assignment: state.workers.next_assignment(&req.worker_id),
    })
}

async fn complete_assignment(
    State(state): State<AppState>,
    Json(req): Json<AssignmentComplete>,
) -> Json<AssignmentCompleteResponse> {
    let ok = state.workers.complete(req);
    Json(AssignmentCompleteResponse { ok })
}
