//! Reconnection policy and supervisor.
//!
//! One supervisor task watches one session. Whenever the session drops to
//! `Disconnected` while the instance is still wanted, it sleeps out an
//! exponential backoff and redials. Consecutive failures are counted; at the
//! configured cap the instance is marked permanently failed and the
//! supervisor stands down. A successful reconnect resets the counter.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::session::{SessionClient, SessionState};

/// Backoff schedule and failure cap for one source.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_consecutive_failures: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_consecutive_failures: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_backoff.as_millis() as f64);
        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Everything the supervisor needs from its core.
pub(crate) struct SupervisorContext {
    pub session: Arc<SessionClient>,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub wanted: watch::Receiver<bool>,
    pub failures: Arc<AtomicU32>,
    pub permanently_failed: Arc<AtomicBool>,
    pub last_error: Arc<Mutex<Option<String>>>,
}

pub(crate) async fn run_supervisor(ctx: SupervisorContext) {
    let SupervisorContext {
        session,
        policy,
        connect_timeout,
        mut wanted,
        failures,
        permanently_failed,
        last_error,
    } = ctx;
    let mut state_rx = session.watch_state();
    loop {
        if *state_rx.borrow() != SessionState::Disconnected {
            tokio::select! {
                result = state_rx.wait_for(|s| *s == SessionState::Disconnected) => {
                    if result.is_err() {
                        return;
                    }
                }
                _ = wanted.wait_for(|w| !*w) => return,
            }
        }
        if !*wanted.borrow() {
            return;
        }

        let attempt = failures.load(Ordering::SeqCst) + 1;
        let delay = policy.delay_for_attempt(attempt);
        info!(
            source = session.source_name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wanted.wait_for(|w| !*w) => return,
        }
        if !*wanted.borrow() {
            return;
        }

        match session.connect(connect_timeout).await {
            Ok(()) => {
                failures.store(0, Ordering::SeqCst);
                info!(source = session.source_name(), "reconnected");
            }
            Err(e) => {
                let so_far = failures.fetch_add(1, Ordering::SeqCst) + 1;
                *last_error.lock().unwrap() = Some(e.to_string());
                warn!(
                    source = session.source_name(),
                    error = %e,
                    consecutive_failures = so_far,
                    cap = policy.max_consecutive_failures,
                    "reconnect attempt failed"
                );
                if so_far >= policy.max_consecutive_failures {
                    permanently_failed.store(true, Ordering::SeqCst);
                    error!(
                        source = session.source_name(),
                        failures = so_far,
                        "failure cap reached, giving up on this source"
                    );
                    return;
                }
            }
        }
    }
}
