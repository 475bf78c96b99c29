//! The echo source handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tether::{ActiveConfig, ConfigSpec, Envelope, SessionSender, SourceHandler};
use tracing::info;

/// Answers every query with its own payload, a receive timestamp and a
/// running sequence number. Publishes are only counted.
pub struct EchoHandler {
    prefix: Mutex<Option<String>>,
    sequence: AtomicU64,
    publishes_seen: AtomicU64,
}

impl EchoHandler {
    pub fn new() -> Self {
        EchoHandler {
            prefix: Mutex::new(None),
            sequence: AtomicU64::new(0),
            publishes_seen: AtomicU64::new(0),
        }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    // Nothing is required; `echoPrefix` is honored when present.
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::default()
    }

    async fn on_configure(&self, session: SessionSender, config: &ActiveConfig) -> Result<()> {
        let prefix = config.get_str("echoPrefix").map(str::to_string);
        info!(prefix = ?prefix, "echo source configured");
        *self.prefix.lock().unwrap() = prefix;
        session.notify(json!({
            "event": "echoReady",
            "at": Utc::now().to_rfc3339(),
        }));
        Ok(())
    }

    async fn on_publish(&self, envelope: Envelope) -> Result<()> {
        let seen = self.publishes_seen.fetch_add(1, Ordering::SeqCst) + 1;
        info!(total = seen, payload = %envelope.payload, "publish received");
        Ok(())
    }

    async fn on_query(&self, envelope: Envelope) -> Result<Value> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut reply = json!({
            "echo": envelope.payload,
            "receivedAt": Utc::now().to_rfc3339(),
            "sequence": sequence,
        });
        if let Some(prefix) = self.prefix.lock().unwrap().clone() {
            reply["prefix"] = Value::String(prefix);
        }
        Ok(reply)
    }
}
