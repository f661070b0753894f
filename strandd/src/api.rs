//! HTTP API for the Strand daemon.
//!
//! Provides REST endpoints for:
//! - Health check
//! - Projection status, checkpoints and read models
//! - Projection lifecycle (start, stop, reset)
//! - Appending to and reading from event streams
//! - Prometheus metrics

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strand_eventlog::{Event, EventLog, EventLogError, NewEvent, Position, FIRST_POSITION};
use strand_projector::{ProjectionEngine, ProjectionError, ProjectionStatus};
use strand_store::Checkpoint;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::error::DaemonError;
use crate::metrics::Metrics;
use crate::samples::ReadModel;

/// Upper bound on events returned by one read.
const MAX_READ_LIMIT: usize = 1000;

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState {
    pub engine: Arc<ProjectionEngine>,
    pub log: Arc<dyn EventLog>,
    pub read_models: BTreeMap<String, Arc<dyn ReadModel>>,
    pub metrics: Metrics,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Reset response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub projection: String,
    /// Checkpoints deleted
    pub removed: u64,
}

/// Request to append an event.
#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Response after appending an event.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub stream: String,
    pub position: Position,
}

/// Read query: `?from=N&limit=M`.
#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub from: Option<Position>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// An event as returned by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventView {
    pub event_id: Uuid,
    pub stream: String,
    pub position: Position,
    pub event_type: String,
    /// JSON payload, or the raw bytes as a lossy string when not JSON
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<Event> for EventView {
    fn from(event: Event) -> Self {
        fn decode(bytes: &[u8]) -> Value {
            serde_json::from_slice(bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }

        Self {
            payload: decode(&event.payload),
            metadata: event.metadata.as_deref().map(decode),
            event_id: event.event_id,
            stream: event.stream,
            position: event.position,
            event_type: event.event_type,
            created_at: event.created_at,
        }
    }
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/projections", get(list_projections_handler))
        .route("/projections/:name", get(get_projection_handler))
        .route("/projections/:name/checkpoints", get(checkpoints_handler))
        .route("/projections/:name/read-model", get(read_model_handler))
        .route("/projections/:name/start", post(start_handler))
        .route("/projections/:name/stop", post(stop_handler))
        .route("/projections/:name/reset", post(reset_handler))
        .route("/streams/:stream/events", post(append_handler).get(read_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn metrics_handler(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    let body = state.metrics.render(&state.engine.statuses()).map_err(to_error_response)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn list_projections_handler(State(state): State<Arc<ApiState>>) -> Json<Vec<ProjectionStatus>> {
    Json(state.engine.statuses())
}

async fn get_projection_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProjectionStatus>> {
    let status = state.engine.status(&name).map_err(|e| to_error_response(e.into()))?;
    Ok(Json(status))
}

async fn checkpoints_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<Checkpoint>>> {
    let checkpoints = state.engine.checkpoints(&name).await.map_err(|e| to_error_response(e.into()))?;
    Ok(Json(checkpoints))
}

async fn read_model_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let model = state
        .read_models
        .get(&name)
        .ok_or_else(|| to_error_response(DaemonError::ReadModelNotFound(name.clone())))?;
    Ok(Json(model.snapshot()))
}

/// Start a processing run.
async fn start_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<ProjectionStatus>)> {
    state.engine.start(&name).await.map_err(|e| to_error_response(e.into()))?;
    info!(projection = %name, "Projection started via API");

    let status = state.engine.status(&name).map_err(|e| to_error_response(e.into()))?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

/// Stop gracefully and wait for the run to end.
async fn stop_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProjectionStatus>> {
    state.engine.stop(&name).await.map_err(|e| to_error_response(e.into()))?;
    info!(projection = %name, "Projection stopped via API");

    let status = state.engine.status(&name).map_err(|e| to_error_response(e.into()))?;
    Ok(Json(status))
}

/// Delete the checkpoints of a stopped projection and clear its read model.
async fn reset_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ResetResponse>> {
    let removed = state.engine.reset(&name).await.map_err(|e| to_error_response(e.into()))?;
    if let Some(model) = state.read_models.get(&name) {
        model.clear();
    }
    info!(projection = %name, removed, "Projection reset via API");

    Ok(Json(ResetResponse {
        projection: name,
        removed,
    }))
}

async fn append_handler(
    State(state): State<Arc<ApiState>>,
    Path(stream): Path<String>,
    Json(request): Json<AppendRequest>,
) -> ApiResult<(StatusCode, Json<AppendResponse>)> {
    let mut event = NewEvent::json(request.event_type, &request.payload).map_err(|e| to_error_response(e.into()))?;
    if let Some(metadata) = &request.metadata {
        event = event.with_json_metadata(metadata).map_err(|e| to_error_response(e.into()))?;
    }

    let position = state.log.append(&stream, event).await.map_err(|e| to_error_response(e.into()))?;

    Ok((StatusCode::CREATED, Json(AppendResponse { stream, position })))
}

async fn read_handler(
    State(state): State<Arc<ApiState>>,
    Path(stream): Path<String>,
    Query(query): Query<ReadQuery>,
) -> ApiResult<Json<Vec<EventView>>> {
    let from = query.from.unwrap_or(FIRST_POSITION);
    if from < FIRST_POSITION {
        return Err(to_error_response(DaemonError::InvalidRequest(format!(
            "from must not be negative, got {from}"
        ))));
    }
    let limit = query.limit.unwrap_or(MAX_READ_LIMIT).min(MAX_READ_LIMIT);

    let events: Vec<Event> = state
        .log
        .read(&stream, from)
        .take(limit)
        .try_collect()
        .await
        .map_err(|e| to_error_response(e.into()))?;

    Ok(Json(events.into_iter().map(EventView::from).collect()))
}

// =============================================================================
// Helpers
// =============================================================================

fn to_error_response(error: DaemonError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        DaemonError::Projection(ProjectionError::NotRegistered(_)) | DaemonError::ReadModelNotFound(_) => {
            StatusCode::NOT_FOUND
        },
        DaemonError::Projection(ProjectionError::AlreadyRunning(_)) => StatusCode::CONFLICT,
        DaemonError::Projection(ProjectionError::Configuration(_))
        | DaemonError::EventLog(EventLogError::InvalidEvent(_) | EventLogError::Serialization(_))
        | DaemonError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DaemonError::EventLog(_) | DaemonError::Store(_) | DaemonError::Projection(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

// =============================================================================
// Tests
// =============================================================================
