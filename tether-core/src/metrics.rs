// ABOUTME: Prometheus metrics initialization and recording helpers.
// ABOUTME: Thin wrappers so call sites stay one-liners and label names stay consistent.

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return the render handle for
/// the /metrics route. Call once at server startup.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    describe_counter!(
        "tether_publish_total",
        "Publish calls by outcome (ok, timeout, no_worker, cancelled, replaced, worker_gone, duplicate)"
    );
    describe_counter!(
        "tether_poll_total",
        "Worker poll calls by outcome (events, empty)"
    );
    describe_counter!(
        "tether_response_total",
        "Worker responses by outcome (delivered, orphan, mismatch)"
    );
    describe_counter!("tether_register_total", "Worker registrations");
    describe_gauge!("tether_workers", "Currently registered workers");
    describe_gauge!("tether_inflight", "Events dispatched and awaiting response");

    Ok(handle)
}

pub fn record_publish(outcome: &'static str) {
    counter!("tether_publish_total", "outcome" => outcome).increment(1);
}

pub fn record_poll(outcome: &'static str) {
    counter!("tether_poll_total", "outcome" => outcome).increment(1);
}

pub fn record_response(outcome: &'static str) {
    counter!("tether_response_total", "outcome" => outcome).increment(1);
}

pub fn record_register() {
    counter!("tether_register_total").increment(1);
}

pub fn set_worker_count(count: u64) {
    gauge!("tether_workers").set(count as f64);
}

pub fn set_inflight(count: u64) {
    gauge!("tether_inflight").set(count as f64);
}
