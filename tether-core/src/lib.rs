// ABOUTME: Platform-agnostic relay broker core
// ABOUTME: Worker registry, router, and the event bus bridging webhooks to pull-only workers

pub mod bus;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;

// Re-export the types most callers touch
pub use bus::EventBus;
pub use config::{BrokerConfig, Config, ServerConfig};
pub use error::{PublishError, WorkerError};
pub use protocol::{
    capability_key, EnvelopeKind, EventEnvelope, EventPayload, HeartbeatRequest, HeartbeatStatus,
    PollResponse, RegisterRequest, ResponseEnvelope, ResponsePayload,
};
pub use registry::{Registry, SweepOutcome, WorkerRecord, WorkerState};
pub use router::Router;
