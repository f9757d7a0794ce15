// ABOUTME: Event bus bridging blocking publish calls to pull-only workers.
// ABOUTME: Owns the pending-request table and the per-worker FIFO outbound queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{PublishError, WorkerError};
use crate::metrics;
use crate::protocol::{EventEnvelope, RegisterRequest, ResponseEnvelope, ResponsePayload};
use crate::registry::{Registry, SweepOutcome, WorkerRecord};
use crate::router::Router;

/// One blocked publisher. The entry exists in the pending table from publish
/// until exactly one of {response, deadline, cancellation, caller drop}
/// removes it; whoever removes it decrements the worker's inflight counter.
struct Pending {
    worker_id: String,
    tx: oneshot::Sender<Result<ResponsePayload, PublishError>>,
}

/// Outbound queue for one worker registration. The receiver sits behind an
/// async mutex so concurrent polls from the same worker serialize and FIFO
/// order holds. Re-registration replaces the whole queue; events addressed
/// to the prior incarnation die with the old channel.
struct WorkerQueue {
    tx: mpsc::UnboundedSender<EventEnvelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<EventEnvelope>>>,
}

/// The request/response bridge between webhook adapters and workers.
///
/// `publish` suspends the calling task until a matching `respond` arrives or
/// the deadline passes; `poll` suspends until the worker's queue is
/// non-empty or the poll window closes. Everything else is a short critical
/// section.
pub struct EventBus {
    registry: Arc<Registry>,
    router: Router,
    pending: Mutex<HashMap<String, Pending>>,
    queues: Mutex<HashMap<String, WorkerQueue>>,
}

impl EventBus {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            router: Router::new(Arc::clone(&registry)),
            registry,
            pending: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queues(&self) -> MutexGuard<'_, HashMap<String, WorkerQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or re-register) a worker: upsert the registry record and
    /// install a fresh outbound queue. Pending requests dispatched to a
    /// replaced incarnation are failed immediately so their publishers don't
    /// hang until their deadlines.
    pub fn register_worker_at(&self, req: RegisterRequest, now: DateTime<Utc>) -> WorkerRecord {
        let (record, replaced) = self.registry.register_at(req, now);

        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_queues().insert(
            record.id.clone(),
            WorkerQueue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            },
        );

        if replaced {
            let failed = self.fail_pending(&record.id, |worker_id| {
                PublishError::WorkerReplaced { worker_id }
            });
            if failed > 0 {
                tracing::info!(
                    worker_id = %record.id,
                    failed,
                    "Failed pending requests superseded by re-registration"
                );
            }
        }
        metrics::record_register();
        record
    }

    pub fn register_worker(&self, req: RegisterRequest) -> WorkerRecord {
        self.register_worker_at(req, Utc::now())
    }

    /// Publish an event and block until its response, the deadline, or the
    /// caller's cancellation token — whichever fires first. Exactly one of
    /// those paths settles the pending entry; a publisher future dropped
    /// mid-wait settles it on drop.
    pub async fn publish(
        &self,
        event: EventEnvelope,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<ResponsePayload, PublishError> {
        let worker = match self
            .router
            .select(&event.payload.platform, &event.payload.event_type)
        {
            Some(worker) => worker,
            None => {
                metrics::record_publish("no_worker");
                return Err(PublishError::NoEligibleWorker {
                    capability: event.capability(),
                });
            }
        };

        let correlation_id = event.id.clone();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if pending.contains_key(&correlation_id) {
                metrics::record_publish("duplicate");
                return Err(PublishError::DuplicateCorrelationId(correlation_id));
            }
            pending.insert(
                correlation_id.clone(),
                Pending {
                    worker_id: worker.id.clone(),
                    tx,
                },
            );
        }
        self.registry.inc_inflight(&worker.id);

        // Backstop: settles the entry if this future is dropped mid-wait,
        // so a disconnected publisher cannot leak inflight capacity.
        let _guard = SettleGuard {
            bus: self,
            id: &correlation_id,
        };

        if !self.enqueue(&worker.id, event) {
            self.settle(&correlation_id);
            metrics::record_publish("worker_gone");
            return Err(PublishError::WorkerGone {
                worker_id: worker.id,
            });
        }
        tracing::debug!(
            correlation_id = %correlation_id,
            worker_id = %worker.id,
            deadline_ms = deadline.as_millis() as u64,
            "Event dispatched, publisher waiting"
        );

        let wake = tokio::select! {
            biased;
            outcome = &mut rx => Wake::Resolved(outcome),
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = tokio::time::sleep(deadline) => Wake::Deadline,
        };
        match wake {
            // The resolver already removed the entry and decremented
            // inflight. A dropped sender without a send means the worker
            // vanished between settle paths.
            Wake::Resolved(Ok(Ok(payload))) => {
                metrics::record_publish("ok");
                Ok(payload)
            }
            Wake::Resolved(Ok(Err(err))) => {
                metrics::record_publish(publish_failure_label(&err));
                Err(err)
            }
            Wake::Resolved(Err(_)) => {
                metrics::record_publish("worker_gone");
                Err(PublishError::WorkerGone {
                    worker_id: worker.id,
                })
            }
            Wake::Cancelled => {
                if self.settle(&correlation_id).is_some() {
                    metrics::record_publish("cancelled");
                    Err(PublishError::Cancelled)
                } else {
                    // A response raced the cancellation and won the entry.
                    drain_raced_response(rx, &worker.id).await
                }
            }
            Wake::Deadline => {
                if self.settle(&correlation_id).is_some() {
                    metrics::record_publish("timeout");
                    Err(PublishError::Timeout { deadline })
                } else {
                    drain_raced_response(rx, &worker.id).await
                }
            }
        }
    }

    /// Fire-and-forget publish: route and enqueue, no pending entry, no
    /// inflight accounting. For notification-style events that expect no
    /// reply.
    pub fn publish_forget(&self, event: EventEnvelope) -> Result<(), PublishError> {
        let worker = self
            .router
            .select(&event.payload.platform, &event.payload.event_type)
            .ok_or_else(|| PublishError::NoEligibleWorker {
                capability: event.capability(),
            })?;
        if !self.enqueue(&worker.id, event) {
            return Err(PublishError::WorkerGone {
                worker_id: worker.id,
            });
        }
        Ok(())
    }

    /// Long-poll the worker's queue: return immediately with whatever is
    /// queued, otherwise wait up to `timeout` for the first event and drain
    /// anything that arrived with it. An empty list is the normal idle
    /// outcome, not an error.
    pub async fn poll(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Vec<EventEnvelope>, WorkerError> {
        let rx = self
            .lock_queues()
            .get(worker_id)
            .map(|q| Arc::clone(&q.rx))
            .ok_or_else(|| WorkerError::NotRegistered(worker_id.to_string()))?;

        let mut rx = rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        if events.is_empty() {
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(event)) => {
                    events.push(event);
                    while let Ok(event) = rx.try_recv() {
                        events.push(event);
                    }
                }
                // Queue replaced under us, or the window closed empty.
                Ok(None) | Err(_) => {}
            }
        }
        metrics::record_poll(if events.is_empty() { "empty" } else { "events" });
        Ok(events)
    }

    /// Resolve a pending request with a worker's response. An unknown or
    /// expired correlation id is a harmless no-op from the bus's view — the
    /// worker cannot distinguish "too late" from "never existed", so neither
    /// is surfaced as an error. A respond from a worker that does not own
    /// the pending entry is ignored the same way.
    pub fn respond(&self, worker_id: &str, response: ResponseEnvelope) {
        let correlation_id = response.id.clone();
        let mut pending = self.lock_pending();
        match pending.remove(&correlation_id) {
            Some(entry) if entry.worker_id == worker_id => {
                drop(pending);
                self.registry.dec_inflight(worker_id);
                if entry.tx.send(Ok(response.payload)).is_err() {
                    tracing::debug!(
                        correlation_id = %correlation_id,
                        "Publisher gone before response delivery"
                    );
                }
                metrics::record_response("delivered");
            }
            Some(entry) => {
                let owner = entry.worker_id.clone();
                pending.insert(correlation_id.clone(), entry);
                drop(pending);
                tracing::warn!(
                    correlation_id = %correlation_id,
                    responding_worker = %worker_id,
                    owning_worker = %owner,
                    "Response from non-owning worker ignored"
                );
                metrics::record_response("mismatch");
            }
            None => {
                drop(pending);
                tracing::debug!(
                    correlation_id = %correlation_id,
                    worker_id = %worker_id,
                    "Orphan response for expired or unknown correlation id"
                );
                metrics::record_response("orphan");
            }
        }
    }

    /// Run one liveness sweep pass: apply timeout-driven registry
    /// transitions, then tear down queues and fail pending requests for
    /// workers swept offline.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepOutcome {
        let outcome = self.registry.sweep_at(now);
        for worker_id in &outcome.removed {
            self.lock_queues().remove(worker_id);
            let failed = self.fail_pending(worker_id, |worker_id| PublishError::WorkerGone {
                worker_id,
            });
            if failed > 0 {
                tracing::warn!(
                    worker_id = %worker_id,
                    failed,
                    "Failed pending requests for worker swept offline"
                );
            }
        }
        outcome
    }

    pub fn sweep(&self) -> SweepOutcome {
        self.sweep_at(Utc::now())
    }

    /// Number of outstanding pending requests, for introspection and tests.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn has_pending(&self, correlation_id: &str) -> bool {
        self.lock_pending().contains_key(correlation_id)
    }

    fn enqueue(&self, worker_id: &str, event: EventEnvelope) -> bool {
        match self.lock_queues().get(worker_id) {
            Some(queue) => queue.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Take-once removal of a pending entry. The taker decrements inflight;
    /// at most one caller gets `Some` for a given id, which is what keeps a
    /// racing respond and deadline from double-decrementing.
    fn settle(&self, correlation_id: &str) -> Option<Pending> {
        let entry = self.lock_pending().remove(correlation_id);
        if let Some(entry) = &entry {
            self.registry.dec_inflight(&entry.worker_id);
        }
        entry
    }

    /// Remove and fail every pending entry owned by `worker_id`. Decrements
    /// inflight per drained entry, same as every other remover: a publish
    /// whose increment lands between a re-registration's counter reset and
    /// this drain would otherwise strand its increment on the new record.
    /// The decrement saturates, so the common reset and swept-away cases
    /// stay no-ops.
    fn fail_pending<F>(&self, worker_id: &str, make_err: F) -> usize
    where
        F: Fn(String) -> PublishError,
    {
        let drained: Vec<Pending> = {
            let mut pending = self.lock_pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            self.registry.dec_inflight(&entry.worker_id);
            let _ = entry.tx.send(Err(make_err(worker_id.to_string())));
        }
        count
    }
}

/// Which waiter won the publish race.
enum Wake {
    Resolved(Result<Result<ResponsePayload, PublishError>, oneshot::error::RecvError>),
    Cancelled,
    Deadline,
}

/// Settles the pending entry when a publisher future is dropped without
/// reaching any of its normal exit paths (e.g. the webhook client
/// disconnected and axum dropped the handler). No-op when the entry was
/// already taken.
struct SettleGuard<'a> {
    bus: &'a EventBus,
    id: &'a str,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        self.bus.settle(self.id);
    }
}

/// After losing the settle race on timeout/cancel, whoever took the entry
/// is committed to sending on the channel (respond, fail_pending) or has
/// dropped the sender, so awaiting here is bounded. A `try_recv` would race
/// a respond that has removed the entry but not yet sent, misreporting a
/// delivered response as the worker vanishing.
async fn drain_raced_response(
    rx: oneshot::Receiver<Result<ResponsePayload, PublishError>>,
    worker_id: &str,
) -> Result<ResponsePayload, PublishError> {
    match rx.await {
        Ok(Ok(payload)) => {
            metrics::record_publish("ok");
            Ok(payload)
        }
        Ok(Err(err)) => {
            metrics::record_publish(publish_failure_label(&err));
            Err(err)
        }
        Err(_) => {
            metrics::record_publish("worker_gone");
            Err(PublishError::WorkerGone {
                worker_id: worker_id.to_string(),
            })
        }
    }
}

fn publish_failure_label(err: &PublishError) -> &'static str {
    match err {
        PublishError::NoEligibleWorker { .. } => "no_worker",
        PublishError::Timeout { .. } => "timeout",
        PublishError::Cancelled => "cancelled",
        PublishError::WorkerReplaced { .. } => "replaced",
        PublishError::WorkerGone { .. } => "worker_gone",
        PublishError::DuplicateCorrelationId(_) => "duplicate",
    }
}
