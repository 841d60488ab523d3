//! REST endpoints for the leasing engine.
//!
//! The server trusts `provider_id` in request bodies — identity
//! resolution happens upstream of this core.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LeaseError;
use crate::store::SubtaskStore;
use crate::subtasks::engine::LeaseEngine;
use crate::subtasks::heartbeat::HeartbeatMonitor;
use crate::subtasks::lifecycle::LifecycleEngine;
use crate::subtasks::model::{EnvironmentUpdate, Subtask};
use crate::tasks::Task;

/// Shared state for all engine routes.
#[derive(Clone)]
pub struct EngineState {
    pub store: Arc<dyn SubtaskStore>,
    pub clock: Arc<dyn Clock>,
    pub lease: Arc<LeaseEngine>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub lifecycle: Arc<LifecycleEngine>,
}

/// Build the engine router.
pub fn engine_routes(state: EngineState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/subtasks/claim-next", post(claim_next))
        .route("/api/subtasks/available/count", get(available_count))
        .route("/api/subtasks/{id}", get(get_subtask))
        .route("/api/subtasks/{id}/timeline", get(get_timeline))
        .route("/api/subtasks/{id}/accept", post(accept))
        .route("/api/subtasks/{id}/heartbeat", post(heartbeat))
        .route("/api/subtasks/{id}/complete", post(complete))
        .route("/api/subtasks/{id}/fail", post(fail))
        .route("/api/subtasks/{id}/environment", patch(update_environment))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Error mapping ───────────────────────────────────────────────────

/// JSON error envelope with a stable machine-readable code.
struct ApiError(LeaseError);

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        Self(err)
    }
}

impl From<crate::error::DatabaseError> for ApiError {
    fn from(err: crate::error::DatabaseError) -> Self {
        Self(LeaseError::Database(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            LeaseError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            LeaseError::OwnershipConflict { .. } => (StatusCode::CONFLICT, "ownership_conflict"),
            LeaseError::ConcurrencyConflict { .. } => {
                (StatusCode::CONFLICT, "concurrency_conflict")
            }
            LeaseError::LeaseExpired { .. } => (StatusCode::GONE, "lease_expired"),
            LeaseError::InvalidTransition { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_transition")
            }
            LeaseError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            LeaseError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = serde_json::json!({
            "code": code,
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSubtaskRequest {
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub task_type: String,
    pub subtasks: Vec<CreateSubtaskRequest>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task: Task,
    pub subtasks: Vec<Subtask>,
}

/// POST /api/tasks — create a task with its pending subtasks.
async fn create_task(
    State(state): State<EngineState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.subtasks.is_empty() {
        return Err(LeaseError::Validation("task needs at least one subtask".into()).into());
    }
    let now = state.clock.now();
    let task = Task::new(req.name, req.task_type, now);
    state.store.insert_task(&task).await?;

    let mut subtasks = Vec::with_capacity(req.subtasks.len());
    for sub_req in req.subtasks {
        let parameters = sub_req
            .parameters
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let sub = Subtask::new(task.id, parameters, now);
        state.store.insert_subtask(&sub).await?;
        subtasks.push(sub);
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse { task, subtasks }),
    ))
}

// ── Leasing ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClaimNextRequest {
    pub provider_id: String,
    pub device_id: String,
    #[serde(default)]
    pub task_type: Option<String>,
}

/// POST /api/subtasks/claim-next — 200 with a subtask, or 204 when the
/// queue is empty (callers back off).
async fn claim_next(
    State(state): State<EngineState>,
    Json(req): Json<ClaimNextRequest>,
) -> Result<Response, ApiError> {
    let claimed = state
        .lease
        .claim_next(&req.provider_id, &req.device_id, req.task_type.as_deref())
        .await?;
    Ok(match claimed {
        Some(sub) => Json(sub).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[derive(Debug, Deserialize)]
pub struct AcceptRequest {
    pub provider_id: String,
    pub device_id: String,
}

/// POST /api/subtasks/{id}/accept
async fn accept(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AcceptRequest>,
) -> Result<Json<Subtask>, ApiError> {
    let sub = state
        .lease
        .accept(id, &req.provider_id, &req.device_id)
        .await?;
    Ok(Json(sub))
}

// ── Heartbeats ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub provider_id: String,
    pub token: i64,
    /// Requested grace in seconds; clamped server-side.
    #[serde(default)]
    pub grace_secs: Option<u64>,
    #[serde(default)]
    pub progress: Option<u8>,
}

/// POST /api/subtasks/{id}/heartbeat
async fn heartbeat(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<crate::subtasks::heartbeat::HeartbeatAck>, ApiError> {
    let ack = state
        .monitor
        .heartbeat(
            id,
            &req.provider_id,
            req.token,
            req.grace_secs.map(Duration::from_secs),
            req.progress,
        )
        .await?;
    Ok(Json(ack))
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub provider_id: String,
    pub token: i64,
    pub results: serde_json::Value,
}

/// POST /api/subtasks/{id}/complete
async fn complete(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<Subtask>, ApiError> {
    let sub = state
        .lifecycle
        .complete(id, &req.provider_id, req.token, req.results)
        .await?;
    Ok(Json(sub))
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub provider_id: String,
    pub token: i64,
    pub reason: String,
    #[serde(default)]
    pub requires_reassignment: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// POST /api/subtasks/{id}/fail
async fn fail(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
    Json(req): Json<FailRequest>,
) -> Result<Json<Subtask>, ApiError> {
    let sub = state
        .lifecycle
        .fail(
            id,
            &req.provider_id,
            req.token,
            &req.reason,
            req.requires_reassignment,
            req.metadata,
        )
        .await?;
    Ok(Json(sub))
}

#[derive(Debug, Deserialize)]
pub struct UpdateEnvironmentRequest {
    pub provider_id: String,
    pub token: i64,
    #[serde(flatten)]
    pub update: EnvironmentUpdate,
}

/// PATCH /api/subtasks/{id}/environment
async fn update_environment(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateEnvironmentRequest>,
) -> Result<Json<Subtask>, ApiError> {
    let sub = state
        .lifecycle
        .update_environment(id, &req.provider_id, req.token, &req.update)
        .await?;
    Ok(Json(sub))
}

// ── Read models ─────────────────────────────────────────────────────

/// GET /api/tasks/{id}
async fn get_task(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or(LeaseError::NotFound(id))?;
    Ok(Json(task))
}

/// GET /api/subtasks/{id}
async fn get_subtask(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Subtask>, ApiError> {
    let sub = state
        .store
        .get_subtask(id)
        .await?
        .ok_or(LeaseError::NotFound(id))?;
    Ok(Json(sub))
}

/// GET /api/subtasks/{id}/timeline — newest first.
async fn get_timeline(
    State(state): State<EngineState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<crate::subtasks::model::TimelineEvent>>, ApiError> {
    state
        .store
        .get_subtask(id)
        .await?
        .ok_or(LeaseError::NotFound(id))?;
    let timeline = state.store.get_timeline(id).await?;
    Ok(Json(timeline))
}

/// GET /api/subtasks/available/count
async fn available_count(
    State(state): State<EngineState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = state.store.count_pending().await?;
    Ok(Json(serde_json::json!({ "available": count })))
}
