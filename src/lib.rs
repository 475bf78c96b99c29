//! Tether - Connection lifecycle runtime for extension source connectors.
//!
//! A connector process holds one WebSocket session per source against the
//! platform and keeps it alive, running handler callbacks for the traffic
//! that arrives on it. This crate owns everything between the socket and the
//! handler:
//!
//! ```text
//!            platform (WebSocket)
//!                    |
//!     +--------------------------------+
//!     |        SessionClient           |
//!     |  handshake, pump, buffering    |
//!     +--------------------------------+
//!        |                        |
//!   ReconnectSupervisor     inbound router
//!   (backoff, failure cap)        |
//!                          +-------------+
//!                          | config      |---> validated ActiveConfig
//!                          | dispatcher  |---> bounded worker pool
//!                          +-------------+
//!                                 |
//!                          SourceHandler (yours)
//! ```
//!
//! # Core Types
//!
//! - [`SourceHandler`] - Trait a connector implements for its domain logic
//! - [`ConnectorCore`] - Lifecycle owner for one source connection
//! - [`ConnectorRegistry`] - All instances of a process, plus fan-out start/stop
//! - [`ConnectorSettings`] - Local TOML tunables (timeouts, backoff, bounds)
//!
//! # Running a Connector
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use tether::{
//!     ActiveConfig, ConnectorCore, ConnectorSettings, Envelope, SessionSender, SourceHandler,
//! };
//!
//! struct Thermometer;
//!
//! #[async_trait]
//! impl SourceHandler for Thermometer {
//!     fn name(&self) -> &str {
//!         "thermometer"
//!     }
//!
//!     async fn on_configure(&self, _session: SessionSender, _config: &ActiveConfig) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn on_publish(&self, _envelope: Envelope) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn on_query(&self, _envelope: Envelope) -> Result<Value> {
//!         Ok(json!({ "celsius": 21.5 }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = ConnectorSettings::default();
//!     let session = settings.session("ws://platform:9800/link", "token", "thermometer-1");
//!     let core = ConnectorCore::new(session, Arc::new(Thermometer), &settings);
//!     if core.start(Duration::from_secs(10)).await {
//!         tokio::signal::ctrl_c().await.unwrap();
//!     }
//!     core.stop().await;
//! }
//! ```

// Status HTTP API over the registry
pub mod api;

// Platform-pushed configuration documents
pub mod config;

// Lifecycle owner for one source
pub mod core;

// Bounded worker pool for inbound traffic
pub mod dispatch;

// Error types
pub mod error;

// Handler seam connectors implement
pub mod handler;

// Wire frames and inbound envelopes
pub mod protocol;

// Reconnect supervision
pub mod reconnect;

// Instance registry
pub mod registry;

// WebSocket session client
pub mod session;

// Local TOML settings
pub mod settings;

// Re-export the types most connectors touch
pub use self::core::{ConnectorCore, CoreStatus};
pub use config::{ActiveConfig, ConfigError, ConfigSpec, DispatchLimits, FieldKind};
pub use error::{ConnectorError, Result};
pub use handler::SourceHandler;
pub use protocol::{Envelope, EnvelopeKind, WireMessage};
pub use registry::{ConnectorRegistry, RegistryError};
pub use session::{SessionClient, SessionSender, SessionSettings, SessionState, StageStatus};
pub use settings::{load_settings, ConnectorSettings};
