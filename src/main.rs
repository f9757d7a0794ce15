// ABOUTME: Main entry point for the tether relay broker
// ABOUTME: Initializes logging, loads config, and runs the HTTP server and sweep task

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether::server;
use tether_core::config::Config;

#[derive(Debug, Parser)]
#[command(name = "tether")]
#[command(about = "Relay broker bridging webhook-driven chat platforms to pull-only workers")]
struct Cli {
    /// Path to the TOML config file (default: $TETHER_CONFIG or ./tether.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC! Broker crashed: {}", panic_info);
        eprintln!("Backtrace:\n{:?}", std::backtrace::Backtrace::force_capture());
    }));

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var("TETHER_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("tether.toml"));
    let mut config = Config::load(&config_path)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    tracing::info!(
        port = config.server.port,
        poll_timeout_secs = config.broker.poll_timeout_secs,
        heartbeat_timeout_secs = config.broker.heartbeat_timeout_secs,
        stale_timeout_secs = config.broker.stale_timeout_secs,
        "Configuration loaded"
    );

    server::start_server(config).await
}
