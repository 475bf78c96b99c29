//! Transport seam between the session client and the actual WebSocket.
//!
//! The session only ever talks to [`SocketDialer`] and the trait objects it
//! returns, so tests can stand in a scripted fake without opening a port.
//! Production uses [`TungsteniteDialer`].

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::error::ConnectorError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections to the platform.
#[async_trait]
pub trait SocketDialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Box<dyn WireSocket>, ConnectorError>;
}

/// A live, unsplit socket. Used sequentially during the handshake, then
/// split into halves for the pump.
#[async_trait]
pub trait WireSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectorError>;

    /// Next text frame; `None` once the peer closed or the stream ended.
    async fn next_text(&mut self) -> Option<Result<String, ConnectorError>>;

    /// Best-effort close notification to the peer.
    async fn close(&mut self);

    fn split(self: Box<Self>) -> (Box<dyn WireSink>, Box<dyn WireStream>);
}

/// Write half of a split socket.
#[async_trait]
pub trait WireSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectorError>;
    async fn close(&mut self);
}

/// Read half of a split socket.
#[async_trait]
pub trait WireStream: Send {
    async fn next_text(&mut self) -> Option<Result<String, ConnectorError>>;
}

// ---------- tokio-tungstenite implementation ----------

/// Production dialer backed by `tokio-tungstenite`.
pub struct TungsteniteDialer;

#[async_trait]
impl SocketDialer for TungsteniteDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn WireSocket>, ConnectorError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok(Box::new(TungsteniteSocket {
            sink: TungsteniteSink { inner: sink },
            stream: TungsteniteStream { inner: stream },
        }))
    }
}

struct TungsteniteSocket {
    sink: TungsteniteSink,
    stream: TungsteniteStream,
}

#[async_trait]
impl WireSocket for TungsteniteSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectorError> {
        self.sink.send_text(text).await
    }

    async fn next_text(&mut self) -> Option<Result<String, ConnectorError>> {
        self.stream.next_text().await
    }

    async fn close(&mut self) {
        self.sink.close().await;
    }

    fn split(self: Box<Self>) -> (Box<dyn WireSink>, Box<dyn WireStream>) {
        (Box::new(self.sink), Box::new(self.stream))
    }
}

struct TungsteniteSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl WireSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectorError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
    }
}

struct TungsteniteStream {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl WireStream for TungsteniteStream {
    async fn next_text(&mut self) -> Option<Result<String, ConnectorError>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Binary(data))) => {
                    warn!(bytes = data.len(), "ignoring unexpected binary frame");
                }
                Some(Ok(Message::Close(_))) => return None,
                // Ping/Pong are handled by the websocket layer itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Some(Err(ConnectorError::ConnectionFailed(e.to_string())))
                }
                None => return None,
            }
        }
    }
}

// ---------- scripted fake for tests ----------
