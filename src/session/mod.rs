//! WebSocket session client for the platform link.
//!
//! One [`SessionClient`] owns one logical connection and walks it through the
//! connect handshake:
//!
//! ```text
//! Disconnected -> Connecting -> WebSocketOpen -> Authenticating
//!     -> Authenticated -> SourceBinding -> SourceConnected
//! ```
//!
//! Any failure drops straight back to `Disconnected`; there are no partial
//! resting states. Each handshake stage also resolves a [`StageSignal`], so a
//! failed connect can be diagnosed to the exact stage it died in.
//!
//! Once connected, the socket is handed to a pump task that reads inbound
//! frames into an envelope channel and drains the outbound pending queue.
//! Senders never touch the socket directly: [`SessionClient::send`] enqueues
//! and returns, whatever the link is doing.

pub(crate) mod queue;
pub(crate) mod socket;
mod state;

pub use queue::SessionSender;
pub use socket::{SocketDialer, TungsteniteDialer, WireSink, WireSocket, WireStream};
pub use state::{
    HandshakeStage, HandshakeStages, SessionState, StageObserver, StageSignal, StageStatus,
};

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ConnectorError;
use crate::protocol::{Envelope, WireMessage};
use queue::PendingQueue;
use state::StateCell;

/// Default bound on the outbound pending queue.
pub const DEFAULT_PENDING_QUEUE_CAPACITY: usize = 256;

/// Bound on the inbound envelope channel between pump and router.
const INBOUND_BUFFER: usize = 256;

/// How long `close` waits for the pump to wind down before aborting it.
const PUMP_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Connection identity and tuning for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub server_url: String,
    pub auth_token: String,
    pub source_name: String,
    pub pending_queue_capacity: usize,
}

impl SessionSettings {
    pub fn new(
        server_url: impl Into<String>,
        auth_token: impl Into<String>,
        source_name: impl Into<String>,
    ) -> Self {
        SessionSettings {
            server_url: server_url.into(),
            auth_token: auth_token.into(),
            source_name: source_name.into(),
            pending_queue_capacity: DEFAULT_PENDING_QUEUE_CAPACITY,
        }
    }
}

/// Client side of one platform session.
pub struct SessionClient {
    settings: SessionSettings,
    dialer: Arc<dyn SocketDialer>,
    state_cell: Arc<StateCell>,
    stages: HandshakeStages,
    pending: Arc<PendingQueue>,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<Envelope>>>,
    pump: TokioMutex<Option<PumpHandle>>,
    connect_gate: TokioMutex<()>,
}

struct PumpHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SessionClient {
    /// Session over a real `tokio-tungstenite` connection.
    pub fn new(settings: SessionSettings) -> Self {
        Self::with_dialer(settings, Arc::new(TungsteniteDialer))
    }

    /// Session over a caller-supplied transport.
    pub fn with_dialer(settings: SessionSettings, dialer: Arc<dyn SocketDialer>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let pending = Arc::new(PendingQueue::new(settings.pending_queue_capacity));
        SessionClient {
            state_cell: StateCell::new(&settings.source_name),
            stages: HandshakeStages::new(),
            pending,
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            pump: TokioMutex::new(None),
            connect_gate: TokioMutex::new(()),
            dialer,
            settings,
        }
    }

    // ---------- observation ----------

    pub fn state(&self) -> SessionState {
        self.state_cell.get()
    }

    /// Watch the current state; coalesces rapid transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_cell.watch()
    }

    /// Every transition in order, for observers that care about the path.
    pub fn transitions(&self) -> broadcast::Receiver<SessionState> {
        self.state_cell.subscribe()
    }

    pub fn socket_open_stage(&self) -> StageObserver {
        self.stages.socket_open.observe()
    }

    pub fn auth_stage(&self) -> StageObserver {
        self.stages.authenticated.observe()
    }

    pub fn bind_stage(&self) -> StageObserver {
        self.stages.source_bound.observe()
    }

    pub fn source_name(&self) -> &str {
        &self.settings.source_name
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Outbound frames discarded to overflow since the session was created.
    pub fn dropped_frames(&self) -> u64 {
        self.pending.dropped_count()
    }

    // ---------- traffic ----------

    /// Handle for producers; cheap to clone, never blocks.
    pub fn sender(&self) -> SessionSender {
        SessionSender::new(Arc::clone(&self.pending))
    }

    /// Enqueue a frame for the platform.
    pub fn send(&self, message: WireMessage) {
        self.pending.push(message);
    }

    /// The inbound envelope stream. Yields `None` never; envelopes keep
    /// flowing across reconnects. Can only be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound_rx.lock().unwrap().take()
    }

    // ---------- lifecycle ----------

    /// Run the full connect handshake within `timeout`.
    ///
    /// On success the session is `SourceConnected` and the pump is running.
    /// On failure the session is back in `Disconnected`, the failed stage
    /// signal carries the reason, and the returned error names the stage.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ConnectorError> {
        let _gate = self.connect_gate.lock().await;
        if self.state_cell.get() != SessionState::Disconnected {
            return Err(ConnectorError::AlreadyConnected);
        }
        self.stages.reset();
        let deadline = Instant::now() + timeout;
        let source = self.settings.source_name.clone();

        self.state_cell.set(SessionState::Connecting);
        info!(source = %source, url = %self.settings.server_url, "connecting to platform");

        let mut socket =
            match tokio::time::timeout_at(deadline, self.dialer.dial(&self.settings.server_url))
                .await
            {
                Err(_) => {
                    return self.fail_stage(
                        &self.stages.socket_open,
                        ConnectorError::HandshakeTimeout {
                            stage: HandshakeStage::SocketOpen,
                            timeout,
                        },
                    )
                }
                Ok(Err(e)) => return self.fail_stage(&self.stages.socket_open, e),
                Ok(Ok(socket)) => socket,
            };
        self.stages.socket_open.succeed();
        self.state_cell.set(SessionState::WebSocketOpen);

        self.state_cell.set(SessionState::Authenticating);
        let auth = WireMessage::Authenticate {
            token: self.settings.auth_token.clone(),
        };
        if let Err(e) = send_frame(socket.as_mut(), &auth).await {
            return self.fail_stage(&self.stages.authenticated, e);
        }
        let reply =
            await_reply(socket.as_mut(), deadline, HandshakeStage::Authenticate, timeout).await;
        let (success, message) = match reply {
            Ok(reply) => reply,
            Err(e) => return self.fail_stage(&self.stages.authenticated, e),
        };
        if !success {
            let reason = message.unwrap_or_else(|| "no reason given".to_string());
            socket.close().await;
            return self.fail_stage(
                &self.stages.authenticated,
                ConnectorError::AuthRejected(reason),
            );
        }
        self.stages.authenticated.succeed();
        self.state_cell.set(SessionState::Authenticated);

        self.state_cell.set(SessionState::SourceBinding);
        let bind = WireMessage::BindSource {
            source_name: source.clone(),
        };
        if let Err(e) = send_frame(socket.as_mut(), &bind).await {
            return self.fail_stage(&self.stages.source_bound, e);
        }
        let reply =
            await_reply(socket.as_mut(), deadline, HandshakeStage::SourceBind, timeout).await;
        let (success, message) = match reply {
            Ok(reply) => reply,
            Err(e) => return self.fail_stage(&self.stages.source_bound, e),
        };
        if !success {
            let reason = message.unwrap_or_else(|| "no reason given".to_string());
            socket.close().await;
            return self.fail_stage(
                &self.stages.source_bound,
                ConnectorError::BindRejected(reason),
            );
        }
        self.stages.source_bound.succeed();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, stream) = socket.split();
        let task = tokio::spawn(run_pump(
            sink,
            stream,
            Arc::clone(&self.pending),
            self.inbound_tx.clone(),
            Arc::clone(&self.state_cell),
            shutdown_rx,
            source.clone(),
        ));
        {
            let mut pump = self.pump.lock().await;
            if let Some(stale) = pump.replace(PumpHandle {
                shutdown: shutdown_tx,
                task,
            }) {
                stale.task.abort();
            }
        }
        self.state_cell.set(SessionState::SourceConnected);
        info!(source = %source, "source connected");
        Ok(())
    }

    /// Close the session and wait for the socket to be released.
    ///
    /// Safe to call repeatedly and from any state; a session that is already
    /// down is left alone.
    pub async fn close(&self, reason: &str) {
        let _gate = self.connect_gate.lock().await;
        let handle = self.pump.lock().await.take();
        if let Some(PumpHandle { shutdown, task }) = handle {
            info!(source = %self.settings.source_name, reason, "closing session");
            let _ = shutdown.send(true);
            let abort = task.abort_handle();
            if tokio::time::timeout(PUMP_CLOSE_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
        self.state_cell.set(SessionState::Disconnected);
    }

    fn fail_stage(
        &self,
        signal: &StageSignal,
        error: ConnectorError,
    ) -> Result<(), ConnectorError> {
        signal.fail(error.to_string());
        self.state_cell.set(SessionState::Disconnected);
        Err(error)
    }
}

async fn send_frame(
    socket: &mut dyn WireSocket,
    message: &WireMessage,
) -> Result<(), ConnectorError> {
    let text = serde_json::to_string(message)?;
    socket.send_text(text).await
}

/// Wait for the success/failure reply belonging to `stage`, ignoring
/// anything else the platform sends in the meantime.
async fn await_reply(
    socket: &mut dyn WireSocket,
    deadline: Instant,
    stage: HandshakeStage,
    timeout: Duration,
) -> Result<(bool, Option<String>), ConnectorError> {
    loop {
        let frame = tokio::time::timeout_at(deadline, socket.next_text())
            .await
            .map_err(|_| ConnectorError::HandshakeTimeout { stage, timeout })?;
        let text = match frame {
            None => {
                return Err(ConnectorError::ConnectionFailed(format!(
                    "connection closed during {stage}"
                )))
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(text)) => text,
        };
        match serde_json::from_str::<WireMessage>(&text) {
            Err(e) => warn!(error = %e, "ignoring unparseable frame during handshake"),
            Ok(WireMessage::AuthResult { success, message })
                if stage == HandshakeStage::Authenticate =>
            {
                return Ok((success, message))
            }
            Ok(WireMessage::BindResult { success, message })
                if stage == HandshakeStage::SourceBind =>
            {
                return Ok((success, message))
            }
            Ok(other) => {
                warn!(op = other.op(), stage = %stage, "ignoring out-of-order frame during handshake")
            }
        }
    }
}

/// Owns the split socket after the handshake: reads frames into the inbound
/// channel and drains the pending queue outward. Reports `Disconnected` on
/// exit.
async fn run_pump(
    mut sink: Box<dyn WireSink>,
    mut stream: Box<dyn WireStream>,
    pending: Arc<PendingQueue>,
    inbound: mpsc::Sender<Envelope>,
    state: Arc<StateCell>,
    mut shutdown: watch::Receiver<bool>,
    source: String,
) {
    loop {
        // Drain before waiting so a wakeup lost to select cancellation can
        // never strand queued frames.
        if let Err(e) = flush_pending(sink.as_mut(), &pending).await {
            warn!(source = %source, error = %e, "websocket write failed");
            break;
        }
        tokio::select! {
            frame = stream.next_text() => match frame {
                Some(Ok(text)) => {
                    if !deliver_inbound(&text, &inbound, &source).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(source = %source, error = %e, "websocket read failed");
                    break;
                }
                None => {
                    info!(source = %source, "platform closed the connection");
                    break;
                }
            },
            _ = pending.ready() => {}
            _ = shutdown.changed() => {
                sink.close().await;
                break;
            }
        }
    }
    state.set(SessionState::Disconnected);
}

async fn flush_pending(
    sink: &mut dyn WireSink,
    pending: &PendingQueue,
) -> Result<(), ConnectorError> {
    while let Some(message) = pending.pop() {
        let text = serde_json::to_string(&message)?;
        sink.send_text(text).await?;
    }
    Ok(())
}

/// Parse one inbound frame and hand it to the router. Returns `false` when
/// the consumer side is gone and the pump should stop.
async fn deliver_inbound(text: &str, inbound: &mpsc::Sender<Envelope>, source: &str) -> bool {
    let message: WireMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(source = %source, error = %e, "dropping unparseable frame");
            return true;
        }
    };
    let op = message.op();
    match Envelope::from_wire(message) {
        Some(envelope) => {
            if inbound.send(envelope).await.is_err() {
                info!(source = %source, "inbound consumer gone, stopping pump");
                return false;
            }
            true
        }
        None => {
            warn!(source = %source, op, "dropping unexpected frame");
            true
        }
    }
}
