// ABOUTME: Routing policy: picks which worker receives an inbound event.
// ABOUTME: Capability match, then lowest inflight/capacity ratio, ties broken by freshest heartbeat.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::protocol::capability_key;
use crate::registry::{Registry, WorkerRecord};

/// Selects a target worker for an event. Stateless beyond its registry
/// handle; every call ranks a fresh snapshot of the eligible workers.
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Pick the worker for `"<platform>.<event_type>"`, or `None` when no
    /// routable worker holds that capability.
    ///
    /// Candidates over their concurrency limit stay eligible — there is no
    /// hard admission gate here; overload is observable via introspection
    /// and bounded by publish deadlines, not by rejecting work.
    pub fn select(&self, platform: &str, event_type: &str) -> Option<WorkerRecord> {
        let capability = capability_key(platform, event_type);
        let candidates = self.registry.eligible(&capability);

        let selected = candidates.into_iter().min_by(compare_candidates);
        match &selected {
            Some(worker) => {
                tracing::debug!(
                    capability = %capability,
                    worker_id = %worker.id,
                    inflight = worker.inflight,
                    max_concurrency = worker.max_concurrency,
                    "Routed event to worker"
                );
            }
            None => {
                tracing::debug!(capability = %capability, "No eligible worker");
            }
        }
        selected
    }
}

/// Lower load ratio wins; on a tie the freshest heartbeat wins.
fn compare_candidates(a: &WorkerRecord, b: &WorkerRecord) -> Ordering {
    a.load_ratio()
        .partial_cmp(&b.load_ratio())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
}
