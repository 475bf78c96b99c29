//! Local connector settings.
//!
//! These tune the process itself (timeouts, backoff, queue bounds) and come
//! from a TOML file or defaults. They are distinct from the configuration
//! document the platform pushes after a bind, which is validated by
//! [`crate::config`] and owns the dispatcher limits.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::reconnect::ReconnectPolicy;
use crate::session::{SessionSettings, DEFAULT_PENDING_QUEUE_CAPACITY};

/// Complete local settings, all sections optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectorSettings {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

/// Connection tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    /// Deadline for the whole connect handshake, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Bound on outbound frames buffered while the link is down.
    #[serde(default = "default_pending_queue_capacity")]
    pub pending_queue_capacity: usize,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_pending_queue_capacity() -> usize {
    DEFAULT_PENDING_QUEUE_CAPACITY
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            pending_queue_capacity: default_pending_queue_capacity(),
        }
    }
}

/// Reconnect backoff tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Dispatcher shutdown tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    /// Grace period for in-flight tasks when stopping, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ConnectorSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.dispatch.shutdown_grace_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_consecutive_failures: self.reconnect.max_consecutive_failures,
            initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect.max_backoff_ms),
            multiplier: self.reconnect.multiplier,
            jitter: self.reconnect.jitter,
        }
    }

    /// Session settings for one source under these tunables.
    pub fn session(
        &self,
        server_url: impl Into<String>,
        auth_token: impl Into<String>,
        source_name: impl Into<String>,
    ) -> SessionSettings {
        let mut settings = SessionSettings::new(server_url, auth_token, source_name);
        settings.pending_queue_capacity = self.connection.pending_queue_capacity;
        settings
    }
}

/// Load settings from a TOML file.
pub fn load_settings(path: impl AsRef<Path>) -> Result<ConnectorSettings> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading settings file {}", path.display()))?;
    let settings: ConnectorSettings = toml::from_str(&raw)
        .with_context(|| format!("parsing settings file {}", path.display()))?;
    Ok(settings)
}
