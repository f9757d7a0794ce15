// ABOUTME: Worker registry owning the liveness state machine.
// ABOUTME: All record mutation is serialized through one mutex; handlers never touch the map.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::metrics;
use crate::protocol::{HeartbeatRequest, HeartbeatStatus, RegisterRequest};

/// Liveness state of a worker.
///
/// `Registered` means "announced but not yet heartbeating"; the first ok
/// heartbeat promotes to `Online`. `Stale` workers (missed heartbeats or
/// self-reported degraded) remain routable at reduced preference. Offline
/// is represented by removal: the sweep deletes records silent past the
/// stale timeout, so there is no record left to carry the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Registered,
    Online,
    Stale,
}

/// Snapshot of one registered worker. Cloned out of the registry for
/// routing decisions and introspection; never handed out by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub max_concurrency: u32,
    pub inflight: u32,
    pub load: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Inflight-to-capacity ratio used by the router for load balancing.
    pub fn load_ratio(&self) -> f64 {
        f64::from(self.inflight) / f64::from(self.max_concurrency.max(1))
    }

    /// Routable means the worker may receive events: freshly registered
    /// (its first poll may land before its first heartbeat), online, or
    /// stale but not yet swept offline (degraded capacity, not dead).
    pub fn is_routable(&self) -> bool {
        matches!(
            self.state,
            WorkerState::Registered | WorkerState::Online | WorkerState::Stale
        )
    }
}

/// Outcome of one liveness sweep pass.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Workers newly marked stale this pass.
    pub went_stale: Vec<String>,
    /// Workers removed (offline) this pass; their queued work must be failed.
    pub removed: Vec<String>,
}

/// Registry of workers keyed by id. The only writer of timeout-driven
/// transitions is `sweep_at`; register/heartbeat are the only writers of
/// event-driven transitions. Both serialize through the same mutex.
pub struct Registry {
    workers: Mutex<HashMap<String, WorkerRecord>>,
    heartbeat_timeout: Duration,
    stale_timeout: Duration,
}

impl Registry {
    /// `heartbeat_timeout` drives ONLINE -> STALE, `stale_timeout` drives
    /// STALE -> OFFLINE (both measured from the last heartbeat). Callers
    /// must ensure `heartbeat_timeout < stale_timeout` or STALE is
    /// unreachable before OFFLINE; `Config::validate` enforces this.
    pub fn new(heartbeat_timeout: StdDuration, stale_timeout: StdDuration) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            heartbeat_timeout: Duration::from_std(heartbeat_timeout)
                .unwrap_or(Duration::MAX),
            stale_timeout: Duration::from_std(stale_timeout).unwrap_or(Duration::MAX),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WorkerRecord>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert a worker record. Re-registration supersedes any prior record
    /// for the same id: fresh state, inflight reset to 0. Returns the stored
    /// snapshot and whether an active record was replaced (the caller is
    /// responsible for failing the replaced worker's pending work).
    pub fn register_at(
        &self,
        req: RegisterRequest,
        now: DateTime<Utc>,
    ) -> (WorkerRecord, bool) {
        let id = req
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = WorkerRecord {
            id: id.clone(),
            version: req.version,
            capabilities: req.capabilities.into_iter().collect(),
            max_concurrency: req.max_concurrency.max(1),
            inflight: 0,
            load: 0.0,
            labels: req.labels,
            state: WorkerState::Registered,
            last_heartbeat: None,
            connected_at: now,
        };

        let mut workers = self.lock();
        let replaced = workers.insert(id.clone(), record.clone()).is_some();
        metrics::set_worker_count(workers.len() as u64);
        drop(workers);

        if replaced {
            tracing::info!(worker_id = %id, "Worker re-registered, prior record superseded");
        } else {
            tracing::info!(worker_id = %id, "Worker registered");
        }
        (record, replaced)
    }

    pub fn register(&self, req: RegisterRequest) -> (WorkerRecord, bool) {
        self.register_at(req, Utc::now())
    }

    /// Apply a heartbeat: refresh `last_heartbeat`, record advisory load,
    /// and run the event-driven transition (ok promotes REGISTERED/STALE to
    /// ONLINE, degraded demotes to STALE). Heartbeats from unknown ids are
    /// rejected, not treated as implicit re-registration — a heartbeat
    /// carries none of the capabilities the registry needs.
    pub fn heartbeat_at(
        &self,
        worker_id: &str,
        req: &HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> Result<WorkerState, WorkerError> {
        let mut workers = self.lock();
        let record = workers
            .get_mut(worker_id)
            .ok_or_else(|| WorkerError::NotRegistered(worker_id.to_string()))?;

        record.last_heartbeat = Some(now);
        if let Some(load) = req.load {
            record.load = load;
        }
        let previous = record.state;
        record.state = match req.status {
            HeartbeatStatus::Ok => WorkerState::Online,
            HeartbeatStatus::Degraded => WorkerState::Stale,
        };
        if previous != record.state {
            tracing::info!(
                worker_id = %worker_id,
                from = ?previous,
                to = ?record.state,
                "Worker liveness transition"
            );
        }
        Ok(record.state)
    }

    pub fn heartbeat(
        &self,
        worker_id: &str,
        req: &HeartbeatRequest,
    ) -> Result<WorkerState, WorkerError> {
        self.heartbeat_at(worker_id, req, Utc::now())
    }

    /// Timeout-driven transitions, run from the periodic sweep task. A
    /// worker with no heartbeat for `heartbeat_timeout` goes STALE; one
    /// silent for `stale_timeout` is removed. Workers that registered but
    /// never heartbeated are measured from `connected_at`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut workers = self.lock();

        workers.retain(|id, record| {
            let reference = record.last_heartbeat.unwrap_or(record.connected_at);
            let silent_for = now.signed_duration_since(reference);
            if silent_for > self.stale_timeout {
                tracing::warn!(worker_id = %id, "Worker silent past stale timeout, removing");
                outcome.removed.push(id.clone());
                return false;
            }
            if silent_for > self.heartbeat_timeout && record.state != WorkerState::Stale {
                tracing::warn!(worker_id = %id, "Worker missed heartbeat window, marking stale");
                record.state = WorkerState::Stale;
                outcome.went_stale.push(id.clone());
            }
            true
        });
        metrics::set_worker_count(workers.len() as u64);
        outcome
    }

    pub fn sweep(&self) -> SweepOutcome {
        self.sweep_at(Utc::now())
    }

    /// Increment the dispatched-event counter for a worker.
    pub fn inc_inflight(&self, worker_id: &str) {
        let mut workers = self.lock();
        if let Some(record) = workers.get_mut(worker_id) {
            record.inflight += 1;
        }
        metrics::set_inflight(total_inflight(&workers));
    }

    /// Decrement the dispatched-event counter. Saturating: the counter is
    /// reset on re-registration, so a settle racing a re-register must not
    /// underflow.
    pub fn dec_inflight(&self, worker_id: &str) {
        let mut workers = self.lock();
        if let Some(record) = workers.get_mut(worker_id) {
            record.inflight = record.inflight.saturating_sub(1);
        }
        metrics::set_inflight(total_inflight(&workers));
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.lock().get(worker_id).cloned()
    }

    pub fn is_registered(&self, worker_id: &str) -> bool {
        self.lock().contains_key(worker_id)
    }

    /// Routable workers holding the given capability key, cloned for the
    /// router to rank without holding the registry lock.
    pub fn eligible(&self, capability: &str) -> Vec<WorkerRecord> {
        self.lock()
            .values()
            .filter(|r| r.is_routable() && r.capabilities.contains(capability))
            .cloned()
            .collect()
    }

    /// All records, sorted by id for stable introspection output.
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sum of inflight counters across all workers, for `/health`.
    pub fn total_inflight(&self) -> u64 {
        total_inflight(&self.lock())
    }
}

fn total_inflight(workers: &HashMap<String, WorkerRecord>) -> u64 {
    workers.values().map(|r| u64::from(r.inflight)).sum()
}
