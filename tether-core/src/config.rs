// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates timeout ordering and provides sensible defaults for optional fields

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Timing knobs for the broker core. All durations are seconds; the
/// liveness machine requires `heartbeat_timeout < stale_timeout` (or STALE
/// is unreachable before OFFLINE) and `sweep_interval < heartbeat_timeout`
/// (or transitions lag a full window).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// How long a worker poll is held open before returning empty.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Advisory heartbeat cadence returned to workers at registration.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Silence past this marks a worker STALE.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Silence past this (from last heartbeat) removes the worker.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
    /// Cadence of the liveness sweep task.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Default deadline for webhook-initiated publishes.
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Defaults to localhost; set to 0.0.0.0 for Docker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
    /// Optional shared secret required on /webhook calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// Custom Debug impl to redact the API key
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("bind_address", &self.bind_address)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn default_poll_timeout_secs() -> u64 {
    25
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_heartbeat_timeout_secs() -> u64 {
    45
}
fn default_stale_timeout_secs() -> u64 {
    180
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_publish_timeout_secs() -> u64 {
    30
}
fn default_port() -> u16 {
    8787
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: default_poll_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            api_key: None,
        }
    }
}

impl BrokerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults so the
    /// broker runs out of the box; a present-but-invalid file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_toml(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "No config file found, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Invalid TOML")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.broker;
        for (name, value) in [
            ("poll_timeout_secs", b.poll_timeout_secs),
            ("heartbeat_interval_secs", b.heartbeat_interval_secs),
            ("heartbeat_timeout_secs", b.heartbeat_timeout_secs),
            ("stale_timeout_secs", b.stale_timeout_secs),
            ("sweep_interval_secs", b.sweep_interval_secs),
            ("publish_timeout_secs", b.publish_timeout_secs),
        ] {
            if value == 0 {
                bail!("broker.{} must be greater than zero", name);
            }
        }
        if b.heartbeat_timeout_secs >= b.stale_timeout_secs {
            bail!(
                "broker.heartbeat_timeout_secs ({}) must be less than broker.stale_timeout_secs ({})",
                b.heartbeat_timeout_secs,
                b.stale_timeout_secs
            );
        }
        if b.sweep_interval_secs >= b.heartbeat_timeout_secs {
            bail!(
                "broker.sweep_interval_secs ({}) must be less than broker.heartbeat_timeout_secs ({})",
                b.sweep_interval_secs,
                b.heartbeat_timeout_secs
            );
        }
        Ok(())
    }
}
