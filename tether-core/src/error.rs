// ABOUTME: Error taxonomy for the broker core.
// ABOUTME: Publish failures are distinct variants so adapters can message users differently.

use std::time::Duration;

use thiserror::Error;

/// Failure modes of a `publish` call. `NoEligibleWorker` and `Timeout` are
/// deliberately separate so an adapter can render "nobody available" vs
/// "still processing" to the end user.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no eligible worker for capability {capability}")]
    NoEligibleWorker { capability: String },

    #[error("no response within the {}ms deadline", deadline.as_millis())]
    Timeout { deadline: Duration },

    #[error("publish cancelled by caller")]
    Cancelled,

    #[error("worker {worker_id} re-registered while the request was pending")]
    WorkerReplaced { worker_id: String },

    #[error("worker {worker_id} went offline while the request was pending")]
    WorkerGone { worker_id: String },

    #[error("correlation id {0} already has an outstanding request")]
    DuplicateCorrelationId(String),
}

/// Errors from worker-facing registry and bus operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0} is not registered")]
    NotRegistered(String),
}
