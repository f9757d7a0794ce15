// ABOUTME: Generic webhook adapter endpoint for normalized platform events.
// ABOUTME: Publishes onto the bus and maps publish failures to platform-visible statuses.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::server::AppState;
use tether_core::error::PublishError;
use tether_core::protocol::EventEnvelope;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    /// Target session hint, passed through to the worker untouched.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Normalized platform payload; the broker never looks inside.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Per-request deadline override, capped at the configured default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Map<String, Value>>,
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(WebhookReply {
            success: false,
            message: Some(message.into()),
            response_url: None,
            body: None,
        }),
    )
        .into_response()
}

/// POST /webhook/{platform}/{event_type} — the adapter boundary. Accepts a
/// normalized event, publishes it with a deadline, and blocks for the
/// worker's response. "Nobody available" and "no response yet" map to
/// distinct statuses so adapters can message users differently.
pub async fn webhook_handler(
    State(state): State<AppState>,
    Path((platform, event_type)): Path<(String, String)>,
    Json(req): Json<WebhookRequest>,
) -> Response {
    // Validate API key if configured
    if let Some(expected_key) = &state.config.server.api_key {
        match &req.api_key {
            Some(provided_key) if provided_key == expected_key => {
                // Valid key, continue
            }
            _ => {
                tracing::warn!(platform = %platform, "Webhook authentication failed");
                return failure(StatusCode::UNAUTHORIZED, "Invalid or missing API key");
            }
        }
    }

    let default_deadline = state.config.broker.publish_timeout();
    let deadline = req
        .timeout_secs
        .map(std::time::Duration::from_secs)
        .map(|d| d.min(default_deadline))
        .unwrap_or(default_deadline);

    let event = EventEnvelope::new(req.session_id, platform.clone(), event_type.clone(), req.data);
    let correlation_id = event.id.clone();
    tracing::info!(
        platform = %platform,
        event_type = %event_type,
        correlation_id = %correlation_id,
        "Webhook event received"
    );

    match state
        .bus
        .publish(event, deadline, CancellationToken::new())
        .await
    {
        Ok(payload) => (
            StatusCode::OK,
            Json(WebhookReply {
                success: true,
                message: None,
                response_url: payload.response_url,
                body: Some(payload.body),
            }),
        )
            .into_response(),
        Err(err @ PublishError::NoEligibleWorker { .. }) => {
            failure(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        Err(PublishError::Timeout { .. }) => failure(
            StatusCode::GATEWAY_TIMEOUT,
            "No response yet — the request is still being processed",
        ),
        Err(err @ (PublishError::WorkerReplaced { .. } | PublishError::WorkerGone { .. })) => {
            failure(StatusCode::BAD_GATEWAY, err.to_string())
        }
        Err(err) => {
            tracing::error!(correlation_id = %correlation_id, error = %err, "Publish failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
