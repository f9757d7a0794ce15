// ABOUTME: Shared broker state, route assembly, and the serve loop.
// ABOUTME: Wires the registry/bus core to the axum transport and spawns the liveness sweep task.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::{transport, webhook};
use tether_core::{config::Config, metrics, registry::Registry, EventBus};

/// Shared state behind every handler. The registry and bus are the only
/// mutable pieces; handlers go through their methods, never the maps.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new(
            config.broker.heartbeat_timeout(),
            config.broker.stale_timeout(),
        ));
        Self {
            config: Arc::new(config),
            bus: Arc::new(EventBus::new(registry)),
        }
    }
}

/// Build the broker's route table. Metrics are merged separately in
/// `start_server` so tests can build the app without a global recorder.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/worker/register", post(transport::register_handler))
        .route("/worker/poll", get(transport::poll_handler))
        .route("/worker/response", post(transport::respond_handler))
        .route("/worker/heartbeat", post(transport::heartbeat_handler))
        .route("/worker/list", get(transport::list_handler))
        .route("/health", get(transport::health_handler))
        .route(
            "/webhook/{platform}/{event_type}",
            post(webhook::webhook_handler),
        )
        .with_state(state)
}

/// Spawn the periodic liveness sweep. The sweep is the only writer of
/// timeout-driven state transitions; the interval must undercut the
/// heartbeat timeout, which `Config::validate` guarantees.
fn spawn_sweep_task(state: &AppState) {
    let bus = Arc::clone(&state.bus);
    let interval = state.config.broker.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = bus.sweep();
            if !outcome.went_stale.is_empty() || !outcome.removed.is_empty() {
                tracing::info!(
                    went_stale = outcome.went_stale.len(),
                    removed = outcome.removed.len(),
                    "Liveness sweep applied transitions"
                );
            }
        }
    });
}

/// Start the broker HTTP server and run until shutdown.
pub async fn start_server(config: Config) -> Result<()> {
    let metrics_handle =
        metrics::init_metrics().context("Failed to initialize Prometheus metrics")?;

    let state = AppState::new(config);
    spawn_sweep_task(&state);

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(metrics_handle));

    let app = build_router(state.clone())
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http());

    // Default to localhost, but allow override for Docker (needs 0.0.0.0)
    let bind_addr = std::env::var("TETHER_BIND_ADDRESS")
        .ok()
        .or_else(|| state.config.server.bind_address.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let addr = format!("{}:{}", bind_addr, state.config.server.port);
    tracing::info!(addr = %addr, "Starting broker server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> String {
    handle.render()
}
