//! Connector core: one source, end to end.
//!
//! A [`ConnectorCore`] owns the session for a single source plus everything
//! that hangs off it: the reconnect supervisor, the configuration pipeline
//! and the request dispatcher. [`ConnectorCore::start`] brings the source
//! online and returns whether the first connect landed; after that the
//! supervisor keeps the link alive until [`ConnectorCore::stop`] or a
//! permanent failure.
//!
//! Inbound envelopes flow through a router task. Configuration envelopes are
//! validated and swap the dispatcher; everything else goes to the current
//! dispatcher, or is refused with `connector.not.ready` when no configuration
//! has been applied yet.


use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ActiveConfig, ConfigHandler};
use crate::dispatch::{DispatchCounts, DispatchStats, RequestDispatcher};
use crate::handler::SourceHandler;
use crate::protocol::{error_codes, Envelope, EnvelopeKind, WireMessage};
use crate::reconnect::{run_supervisor, ReconnectPolicy, SupervisorContext};
use crate::session::{SessionClient, SessionSettings, SessionState, SocketDialer};
use crate::settings::ConnectorSettings;

// ---------- status snapshot ----------

/// Point-in-time view of one connector instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStatus {
    pub source: String,
    pub instance_id: Uuid,
    pub session_state: SessionState,
    pub healthy: bool,
    pub permanently_failed: bool,
    pub consecutive_failures: u32,
    pub config_applied: bool,
    pub dispatch: DispatchCounts,
    /// Outbound frames currently parked waiting for a live link.
    pub pending_outbound: usize,
    /// Outbound frames evicted because the offline buffer overflowed.
    pub dropped_outbound: u64,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

// ---------- core ----------

/// Lifecycle owner for a single source connection.
pub struct ConnectorCore {
    source: String,
    instance_id: Uuid,
    session: Arc<SessionClient>,
    handler: Arc<dyn SourceHandler>,
    connect_timeout: Duration,
    shutdown_grace: Duration,
    reconnect_policy: ReconnectPolicy,
    /// Flipped to `false` on stop or terminal rejection; the supervisor
    /// watches it and stands down.
    wanted: Arc<watch::Sender<bool>>,
    dispatcher: Arc<TokioMutex<Option<RequestDispatcher>>>,
    dispatch_stats: Arc<DispatchStats>,
    active_config: Arc<StdMutex<Option<ActiveConfig>>>,
    failures: Arc<AtomicU32>,
    permanently_failed: Arc<AtomicBool>,
    last_error: Arc<StdMutex<Option<String>>>,
    connected_at: StdMutex<Option<DateTime<Utc>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: TokioMutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ConnectorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorCore")
            .field("source", &self.source)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl ConnectorCore {
    pub fn new(
        session_settings: SessionSettings,
        handler: Arc<dyn SourceHandler>,
        settings: &ConnectorSettings,
    ) -> Self {
        Self::build(SessionClient::new(session_settings), handler, settings)
    }

    /// Same as [`ConnectorCore::new`] but over a custom transport.
    pub fn with_dialer(
        session_settings: SessionSettings,
        dialer: Arc<dyn SocketDialer>,
        handler: Arc<dyn SourceHandler>,
        settings: &ConnectorSettings,
    ) -> Self {
        Self::build(
            SessionClient::with_dialer(session_settings, dialer),
            handler,
            settings,
        )
    }

    fn build(
        session: SessionClient,
        handler: Arc<dyn SourceHandler>,
        settings: &ConnectorSettings,
    ) -> Self {
        let (wanted, _) = watch::channel(true);
        ConnectorCore {
            source: session.source_name().to_string(),
            instance_id: Uuid::new_v4(),
            session: Arc::new(session),
            handler,
            connect_timeout: settings.connect_timeout(),
            shutdown_grace: settings.shutdown_grace(),
            reconnect_policy: settings.reconnect_policy(),
            wanted: Arc::new(wanted),
            dispatcher: Arc::new(TokioMutex::new(None)),
            dispatch_stats: Arc::new(DispatchStats::default()),
            active_config: Arc::new(StdMutex::new(None)),
            failures: Arc::new(AtomicU32::new(0)),
            permanently_failed: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(StdMutex::new(None)),
            connected_at: StdMutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: TokioMutex::new(Vec::new()),
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The underlying session, for stage observers and state watching.
    pub fn session(&self) -> &SessionClient {
        &self.session
    }

    /// Connect and bring the source online.
    ///
    /// Returns `true` once the session reaches `SourceConnected` within
    /// `timeout`. On `false` nothing keeps running and `start` may be called
    /// again; per-stage diagnosis is available through the session's stage
    /// observers ([`SessionClient::auth_stage`] and friends).
    pub async fn start(&self, timeout: Duration) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            warn!(source = %self.source, "start called on a stopped instance");
            return false;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(source = %self.source, "start called twice");
            return self.is_healthy();
        }
        let _ = self.wanted.send(true);
        info!(source = %self.source, instance = %self.instance_id, "starting connector");

        if let Err(error) = self.session.connect(timeout).await {
            warn!(source = %self.source, error = %error, "initial connect failed");
            *self.last_error.lock().unwrap() = Some(error.to_string());
            self.started.store(false, Ordering::SeqCst);
            return false;
        }
        if self.stopped.load(Ordering::SeqCst) {
            self.session.close("stopped during startup").await;
            return false;
        }
        *self.connected_at.lock().unwrap() = Some(Utc::now());

        let inbound = match self.session.take_inbound() {
            Some(inbound) => inbound,
            None => {
                error!(source = %self.source, "inbound channel already taken");
                return false;
            }
        };
        let router = tokio::spawn(run_router(inbound, self.router_context()));
        let supervisor = tokio::spawn(run_supervisor(SupervisorContext {
            session: Arc::clone(&self.session),
            policy: self.reconnect_policy.clone(),
            connect_timeout: self.connect_timeout,
            wanted: self.wanted.subscribe(),
            failures: Arc::clone(&self.failures),
            permanently_failed: Arc::clone(&self.permanently_failed),
            last_error: Arc::clone(&self.last_error),
        }));
        self.tasks.lock().await.extend([router, supervisor]);

        info!(source = %self.source, "source connected");
        true
    }

    /// Stop the instance. Idempotent; the socket is closed before this
    /// returns and in-flight dispatcher tasks get the shutdown grace.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(source = %self.source, "stopping connector");
        let _ = self.wanted.send(false);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown(self.shutdown_grace).await;
        }
        self.session.close("connector stopped").await;
        info!(source = %self.source, "connector stopped");
    }

    /// `true` only while the session sits in `SourceConnected` and the
    /// instance has not been marked permanently failed.
    pub fn is_healthy(&self) -> bool {
        self.session.state() == SessionState::SourceConnected
            && !self.permanently_failed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> CoreStatus {
        CoreStatus {
            source: self.source.clone(),
            instance_id: self.instance_id,
            session_state: self.session.state(),
            healthy: self.is_healthy(),
            permanently_failed: self.permanently_failed.load(Ordering::SeqCst),
            consecutive_failures: self.failures.load(Ordering::SeqCst),
            config_applied: self.active_config.lock().unwrap().is_some(),
            dispatch: self.dispatch_stats.snapshot(),
            pending_outbound: self.session.pending_len(),
            dropped_outbound: self.session.dropped_frames(),
            last_error: self.last_error.lock().unwrap().clone(),
            connected_at: *self.connected_at.lock().unwrap(),
        }
    }

    fn router_context(&self) -> RouterContext {
        RouterContext {
            source: self.source.clone(),
            session: Arc::clone(&self.session),
            handler: Arc::clone(&self.handler),
            dispatcher: Arc::clone(&self.dispatcher),
            stats: Arc::clone(&self.dispatch_stats),
            active_config: Arc::clone(&self.active_config),
            permanently_failed: Arc::clone(&self.permanently_failed),
            last_error: Arc::clone(&self.last_error),
            wanted: Arc::clone(&self.wanted),
            shutdown_grace: self.shutdown_grace,
        }
    }
}

// ---------- inbound routing ----------

struct RouterContext {
    source: String,
    session: Arc<SessionClient>,
    handler: Arc<dyn SourceHandler>,
    dispatcher: Arc<TokioMutex<Option<RequestDispatcher>>>,
    stats: Arc<DispatchStats>,
    active_config: Arc<StdMutex<Option<ActiveConfig>>>,
    permanently_failed: Arc<AtomicBool>,
    last_error: Arc<StdMutex<Option<String>>>,
    wanted: Arc<watch::Sender<bool>>,
    shutdown_grace: Duration,
}

async fn run_router(mut inbound: mpsc::Receiver<Envelope>, ctx: RouterContext) {
    while let Some(envelope) = inbound.recv().await {
        match envelope.kind {
            EnvelopeKind::Config => {
                if !apply_configuration(&ctx, envelope.payload).await {
                    break;
                }
            }
            _ => {
                let dispatcher = ctx.dispatcher.lock().await;
                match dispatcher.as_ref() {
                    Some(dispatcher) => dispatcher.submit(envelope),
                    None => refuse_before_config(&ctx, envelope),
                }
            }
        }
    }
}

/// Validate a pushed configuration document and swap the dispatcher in.
///
/// Returns `false` when the document was rejected and the instance has been
/// terminated.
async fn apply_configuration(ctx: &RouterContext, document: Value) -> bool {
    let config_handler = ConfigHandler::new(ctx.handler.config_spec());
    let active = match config_handler.evaluate(&document) {
        Ok(active) => active,
        Err(error) => return reject_configuration(ctx, error.to_string()).await,
    };
    if let Err(error) = ctx
        .handler
        .on_configure(ctx.session.sender(), &active)
        .await
    {
        return reject_configuration(ctx, error.to_string()).await;
    }

    let limits = active.limits.clone();
    let dispatcher = RequestDispatcher::new(
        limits.clone(),
        Arc::clone(&ctx.handler),
        ctx.session.sender(),
        Arc::clone(&ctx.stats),
    );
    // Install the replacement before draining the old one so no envelope
    // arrives in the gap between dispatchers.
    let previous = ctx.dispatcher.lock().await.replace(dispatcher);
    *ctx.active_config.lock().unwrap() = Some(active);
    info!(
        source = %ctx.source,
        max_active = limits.max_active_tasks,
        max_queued = limits.max_queued_tasks,
        "configuration applied"
    );
    if let Some(previous) = previous {
        previous.shutdown(ctx.shutdown_grace).await;
    }
    true
}

async fn reject_configuration(ctx: &RouterContext, reason: String) -> bool {
    error!(
        source = %ctx.source,
        reason = %reason,
        "configuration rejected, terminating instance"
    );
    *ctx.last_error.lock().unwrap() = Some(format!("configuration rejected: {reason}"));
    ctx.permanently_failed.store(true, Ordering::SeqCst);
    let _ = ctx.wanted.send(false);
    ctx.session.close("configuration rejected").await;
    false
}

fn refuse_before_config(ctx: &RouterContext, envelope: Envelope) {
    match envelope.kind {
        EnvelopeKind::Query => {
            if let Some(reply_address) = envelope.reply_address {
                ctx.session.sender().send(WireMessage::query_error(
                    reply_address,
                    error_codes::NOT_READY,
                    "no configuration applied yet",
                ));
            }
        }
        kind => {
            warn!(
                source = %ctx.source,
                kind = ?kind,
                "dropping envelope received before configuration"
            );
        }
    }
}
