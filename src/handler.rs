//! The seam connector implementations plug into.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ActiveConfig, ConfigSpec};
use crate::protocol::Envelope;
use crate::session::SessionSender;

/// Connector-specific behavior behind the framework.
///
/// The framework owns the connection lifecycle (handshake, reconnection,
/// configuration validation, dispatch bounds); implementations own the
/// domain. One handler serves one source for the life of the process,
/// across reconnects.
///
/// # Example
///
/// ```
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use tether::config::{ActiveConfig, ConfigSpec, FieldKind};
/// use tether::handler::SourceHandler;
/// use tether::protocol::Envelope;
/// use tether::session::SessionSender;
///
/// struct Thermostat;
///
/// #[async_trait]
/// impl SourceHandler for Thermostat {
///     fn name(&self) -> &str {
///         "thermostat"
///     }
///
///     fn config_spec(&self) -> ConfigSpec {
///         ConfigSpec::default().require("deviceId", FieldKind::String)
///     }
///
///     async fn on_configure(&self, _session: SessionSender, config: &ActiveConfig) -> Result<()> {
///         println!("serving device {}", config.get_str("deviceId").unwrap_or("?"));
///         Ok(())
///     }
///
///     async fn on_publish(&self, envelope: Envelope) -> Result<()> {
///         println!("got {}", envelope.payload);
///         Ok(())
///     }
///
///     async fn on_query(&self, _envelope: Envelope) -> Result<Value> {
///         Ok(json!({ "temperature": 21.5 }))
///     }
/// }
/// ```
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Name used in logs and status output.
    fn name(&self) -> &str;

    /// What this handler demands of configuration documents.
    ///
    /// The default spec names the `general` section and requires nothing.
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::default()
    }

    /// Called once per (re)connection after the framework has validated the
    /// document. `session` is the handle for pushing outbound frames; keep a
    /// clone if the handler emits unsolicited publishes or notifies.
    ///
    /// Returning `Err` rejects the document and terminates the instance.
    async fn on_configure(&self, session: SessionSender, config: &ActiveConfig) -> Result<()>;

    /// An inbound publish or notify. Errors are logged and the envelope is
    /// dropped; they do not affect the session.
    async fn on_publish(&self, envelope: Envelope) -> Result<()>;

    /// An inbound query. The returned value travels back to the query's
    /// reply address; an `Err` becomes a `queryError` reply.
    async fn on_query(&self, envelope: Envelope) -> Result<Value>;
}
