//! Session lifecycle states and per-stage handshake signals.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Lifecycle of one platform session.
///
/// Transitions only ever move forward through the handshake; any failure
/// drops straight back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    WebSocketOpen,
    Authenticating,
    Authenticated,
    SourceBinding,
    SourceConnected,
}

/// The three gated stages of the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    SocketOpen,
    Authenticate,
    SourceBind,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStage::SocketOpen => "socketOpen",
            HandshakeStage::Authenticate => "authenticate",
            HandshakeStage::SourceBind => "sourceBind",
        };
        write!(f, "{name}")
    }
}

/// Outcome of a single handshake stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Succeeded,
    Failed(String),
}

impl StageStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, StageStatus::Pending)
    }
}

/// Completion signal for one handshake stage.
///
/// Each connect attempt resets the signal to `Pending` and later resolves it
/// exactly once; observers can await the resolution or inspect it after the
/// fact to see how far an attempt got.
pub struct StageSignal {
    stage: HandshakeStage,
    tx: watch::Sender<StageStatus>,
}

impl StageSignal {
    fn new(stage: HandshakeStage) -> Self {
        let (tx, _) = watch::channel(StageStatus::Pending);
        StageSignal { stage, tx }
    }

    pub fn observe(&self) -> StageObserver {
        StageObserver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn status(&self) -> StageStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn reset(&self) {
        let _ = self.tx.send(StageStatus::Pending);
    }

    pub(crate) fn succeed(&self) {
        debug!(stage = %self.stage, "handshake stage complete");
        let _ = self.tx.send(StageStatus::Succeeded);
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(stage = %self.stage, reason = %reason, "handshake stage failed");
        let _ = self.tx.send(StageStatus::Failed(reason));
    }
}

/// Read side of a [`StageSignal`].
pub struct StageObserver {
    rx: watch::Receiver<StageStatus>,
}

impl StageObserver {
    /// Current status without waiting.
    pub fn current(&self) -> StageStatus {
        self.rx.borrow().clone()
    }

    /// Wait until the stage resolves one way or the other.
    pub async fn outcome(&mut self) -> StageStatus {
        let result = self
            .rx
            .wait_for(|status| !status.is_pending())
            .await
            .map(|status| status.clone());
        // A dropped sender means the session itself is gone.
        result.unwrap_or_else(|_| StageStatus::Failed("session dropped".to_string()))
    }
}

/// One signal per handshake stage.
pub struct HandshakeStages {
    pub socket_open: StageSignal,
    pub authenticated: StageSignal,
    pub source_bound: StageSignal,
}

impl HandshakeStages {
    pub(crate) fn new() -> Self {
        HandshakeStages {
            socket_open: StageSignal::new(HandshakeStage::SocketOpen),
            authenticated: StageSignal::new(HandshakeStage::Authenticate),
            source_bound: StageSignal::new(HandshakeStage::SourceBind),
        }
    }

    /// Arm all three stages for a fresh connect attempt.
    pub(crate) fn reset(&self) {
        self.socket_open.reset();
        self.authenticated.reset();
        self.source_bound.reset();
    }
}

/// Shared holder for the current state plus a transition feed.
///
/// The `watch` side answers "where are we now"; the `broadcast` side lets
/// observers see every transition in order, which the watch channel alone
/// would coalesce.
pub(crate) struct StateCell {
    current: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionState>,
    source: String,
}

impl StateCell {
    pub(crate) fn new(source: &str) -> Arc<Self> {
        let (current, _) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Arc::new(StateCell {
            current,
            events,
            source: source.to_string(),
        })
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.current.borrow()
    }

    pub(crate) fn set(&self, state: SessionState) {
        let previous = *self.current.borrow();
        if previous == state {
            return;
        }
        debug!(source = %self.source, from = ?previous, to = ?state, "session state change");
        let _ = self.current.send(state);
        let _ = self.events.send(state);
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionState> {
        self.current.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }
}
