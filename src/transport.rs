// ABOUTME: Worker-facing wire protocol handlers: register, long-poll, respond, heartbeat.
// ABOUTME: Plus the /worker/list and /health introspection endpoints.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::server::AppState;
use tether_core::protocol::{
    HeartbeatRequest, PollResponse, RegisterRequest, ResponseEnvelope,
};
use tether_core::registry::{WorkerRecord, WorkerState};

pub const WORKER_ID_HEADER: &str = "x-worker-id";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Identify the calling worker from the X-Worker-Id header.
fn worker_id_from(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(WORKER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Missing X-Worker-Id header"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    #[serde(flatten)]
    record: WorkerRecord,
    /// Advisory cadence the worker should heartbeat at.
    heartbeat_interval_secs: u64,
}

/// POST /worker/register — upsert a worker record. Re-registration at any
/// time supersedes the prior record (last writer wins); its queued work is
/// failed rather than left to hang.
pub async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if req.capabilities.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "At least one capability is required",
        );
    }
    if req.max_concurrency == 0 {
        return error_response(StatusCode::BAD_REQUEST, "maxConcurrency must be at least 1");
    }

    let record = state.bus.register_worker(req);
    (
        StatusCode::OK,
        Json(RegisterResponse {
            record,
            heartbeat_interval_secs: state.config.broker.heartbeat_interval_secs,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct PollParams {
    /// Client-requested poll window; clamped to the configured maximum.
    pub timeout_ms: Option<u64>,
}

/// GET /worker/poll — long-poll for queued events. Returns whatever is
/// queued right away, otherwise holds the request open up to the poll
/// window. An empty list is the normal idle outcome, not an error.
pub async fn poll_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PollParams>,
) -> Response {
    let worker_id = match worker_id_from(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let max_timeout = state.config.broker.poll_timeout();
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .map(|t| t.min(max_timeout))
        .unwrap_or(max_timeout);

    match state.bus.poll(&worker_id, timeout).await {
        Ok(events) => (StatusCode::OK, Json(PollResponse { events })).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct AckBody {
    ok: bool,
}

/// POST /worker/response — resolve a pending request. Always acks: an
/// expired or unknown correlation id is indistinguishable from "too late"
/// on the worker side, and both are harmless no-ops here.
pub async fn respond_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<ResponseEnvelope>,
) -> Response {
    let worker_id = match worker_id_from(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    state.bus.respond(&worker_id, envelope);
    (StatusCode::OK, Json(AckBody { ok: true })).into_response()
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    state: WorkerState,
}

/// POST /worker/heartbeat — refresh liveness. A heartbeat from an unknown
/// id is rejected; the worker must register first (a heartbeat carries no
/// capabilities to register with).
pub async fn heartbeat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    let worker_id = match worker_id_from(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.bus.registry().heartbeat(&worker_id, &req) {
        Ok(worker_state) => (
            StatusCode::OK,
            Json(HeartbeatResponse {
                state: worker_state,
            }),
        )
            .into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string()),
    }
}

/// GET /worker/list — registry snapshots for introspection.
pub async fn list_handler(State(state): State<AppState>) -> Json<Vec<WorkerRecord>> {
    Json(state.bus.registry().snapshot())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub worker_count: usize,
    pub inflight: u64,
    pub timestamp: DateTime<Utc>,
}

/// GET /health — liveness plus the overload signals (worker count and
/// total inflight) operators watch instead of a hard admission gate.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.bus.registry();
    Json(HealthResponse {
        status: "ok",
        worker_count: registry.len(),
        inflight: registry.total_inflight(),
        timestamp: Utc::now(),
    })
}
