//! Error types for the connector runtime.
//!
//! Session-level failures carry the handshake stage they occurred in so a
//! failed startup can be diagnosed without combing through logs.

use std::time::Duration;

use thiserror::Error;

use crate::session::HandshakeStage;

/// Errors surfaced by the session client and the modules built on top of it.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The underlying transport could not be established or gave out mid-use.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A handshake stage did not complete inside the connect deadline.
    #[error("handshake stage `{stage}` timed out after {timeout:?}")]
    HandshakeTimeout {
        stage: HandshakeStage,
        timeout: Duration,
    },

    /// The platform refused the auth token.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The platform refused to bind the requested source.
    #[error("source binding rejected: {0}")]
    BindRejected(String),

    /// `connect` was called while a session is already live.
    #[error("session already connected")]
    AlreadyConnected,

    /// The session has been closed and will not be reopened.
    #[error("session closed")]
    Closed,

    /// The peer sent a frame that does not fit the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A configuration document failed validation or was refused by the handler.
    #[error("configuration rejected: {0}")]
    ConfigRejected(String),

    /// A wire frame could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_error_names_the_stage() {
        let err = ConnectorError::HandshakeTimeout {
            stage: HandshakeStage::Authenticate,
            timeout: Duration::from_secs(5),
        };
        let text = err.to_string();
        assert!(text.contains("authenticate"), "got: {text}");
    }
}
