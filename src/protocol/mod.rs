//! Wire protocol for the platform link.
//!
//! Every frame on the WebSocket is a JSON object tagged by an `op` field.
//! The handshake pair (`authenticate`/`authResult`, `bindSource`/`bindResult`)
//! is consumed by the session client itself; everything after the handshake is
//! lifted into an [`Envelope`] and routed to the connector core.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried by `queryError` frames.
pub mod error_codes {
    /// Worker pool and queue are both full.
    pub const SATURATED: &str = "connector.dispatch.saturated";
    /// The handler returned an error or panicked.
    pub const HANDLER_FAILURE: &str = "connector.handler.failure";
    /// The task sat queued past its deadline.
    pub const TASK_EXPIRED: &str = "connector.task.expired";
    /// No configuration has been applied yet.
    pub const NOT_READY: &str = "connector.not.ready";
    /// The instance is shutting down.
    pub const STOPPING: &str = "connector.instance.stopping";
}

/// A single frame on the platform WebSocket, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WireMessage {
    /// Client -> platform: first frame after the socket opens.
    Authenticate { token: String },
    /// Platform -> client: verdict on the auth token.
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Client -> platform: claim a source name on this connection.
    BindSource { source_name: String },
    /// Platform -> client: verdict on the source binding.
    BindResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Platform -> client: configuration document for the bound source.
    Configure { document: Value },
    /// Data event, either direction.
    Publish { payload: Value },
    /// Fire-and-forget signal, either direction.
    Notify { payload: Value },
    /// Platform -> client: request expecting exactly one reply on `reply_address`.
    Query { payload: Value, reply_address: String },
    /// Client -> platform: successful reply to a query.
    QueryResponse { reply_address: String, payload: Value },
    /// Client -> platform: failure reply to a query.
    QueryError {
        reply_address: String,
        error_code: String,
        message: String,
    },
}

impl WireMessage {
    /// Shorthand for a failure reply to a query.
    pub fn query_error(
        reply_address: impl Into<String>,
        error_code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        WireMessage::QueryError {
            reply_address: reply_address.into(),
            error_code: error_code.into(),
            message: message.into(),
        }
    }

    /// The `op` tag, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            WireMessage::Authenticate { .. } => "authenticate",
            WireMessage::AuthResult { .. } => "authResult",
            WireMessage::BindSource { .. } => "bindSource",
            WireMessage::BindResult { .. } => "bindResult",
            WireMessage::Configure { .. } => "configure",
            WireMessage::Publish { .. } => "publish",
            WireMessage::Notify { .. } => "notify",
            WireMessage::Query { .. } => "query",
            WireMessage::QueryResponse { .. } => "queryResponse",
            WireMessage::QueryError { .. } => "queryError",
        }
    }
}

/// Kind of work an inbound envelope asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Publish,
    Notify,
    Query,
    Config,
}

/// An inbound frame after the handshake, normalized for routing.
///
/// `reply_address` is only present for queries; replies must echo it back
/// verbatim so the platform can correlate them.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub payload: Value,
    pub reply_address: Option<String>,
}

impl Envelope {
    /// Lift a post-handshake inbound frame into an envelope.
    ///
    /// Returns `None` for ops that have no business arriving after the
    /// handshake (stray handshake replies, client-only ops); the session
    /// logs and drops those.
    pub fn from_wire(message: WireMessage) -> Option<Envelope> {
        match message {
            WireMessage::Publish { payload } => Some(Envelope {
                kind: EnvelopeKind::Publish,
                payload,
                reply_address: None,
            }),
            WireMessage::Notify { payload } => Some(Envelope {
                kind: EnvelopeKind::Notify,
                payload,
                reply_address: None,
            }),
            WireMessage::Query {
                payload,
                reply_address,
            } => Some(Envelope {
                kind: EnvelopeKind::Query,
                payload,
                reply_address: Some(reply_address),
            }),
            WireMessage::Configure { document } => Some(Envelope {
                kind: EnvelopeKind::Config,
                payload: document,
                reply_address: None,
            }),
            _ => None,
        }
    }
}
