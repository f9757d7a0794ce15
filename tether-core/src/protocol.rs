// ABOUTME: Wire protocol types shared by the broker and its workers.
// ABOUTME: Defines the event/response envelopes and the register/poll/heartbeat bodies.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Discriminator carried in the `type` field of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Event,
    Response,
}

/// Build the capability key a worker must declare to receive an event,
/// e.g. `("slack", "message")` -> `"slack.message"`.
pub fn capability_key(platform: &str, event_type: &str) -> String {
    format!("{}.{}", platform, event_type)
}

/// Inner payload of an event envelope. `data` is an opaque bag of
/// platform-specific fields (text, userId, channelId, responseUrl, ...);
/// the broker never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub platform: String,
    pub event_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A unit of work flowing from a webhook adapter to a worker.
///
/// The `id` doubles as the correlation id: the worker's response must carry
/// it back so the broker can resolve the waiting publish call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Create a new event with a fresh correlation id and timestamp.
    pub fn new(
        session_id: Option<String>,
        platform: impl Into<String>,
        event_type: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload: EventPayload {
                session_id,
                platform: platform.into(),
                event_type: event_type.into(),
                data,
            },
        }
    }

    /// Capability key this event requires from a worker.
    pub fn capability(&self) -> String {
        capability_key(&self.payload.platform, &self.payload.event_type)
    }
}

/// Inner payload of a response envelope, produced by the worker and handed
/// back to the original publisher. `response_url` is a platform-specific
/// callback target the adapter may use; the broker passes it through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_url: Option<String>,
    #[serde(default)]
    pub body: Map<String, Value>,
}

/// A worker's answer to a previously delivered event. `id` is the
/// correlation id of that event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: ResponsePayload,
}

impl ResponseEnvelope {
    pub fn new(correlation_id: impl Into<String>, payload: ResponsePayload) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            id: correlation_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Body of `POST /worker/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Caller-supplied worker id; generated by the broker when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Capability keys this worker handles, e.g. `["slack.message"]`.
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Worker self-reported liveness, body of `POST /worker/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: HeartbeatStatus,
    /// Advisory load figure, used only for routing tie-breaks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<f64>,
    /// Worker's own view of its inflight count; recorded, not trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inflight: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    #[default]
    Ok,
    Degraded,
}

/// Body of a `GET /worker/poll` reply. Empty `events` means the poll timed
/// out with nothing queued, which is the expected steady state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub events: Vec<EventEnvelope>,
}
