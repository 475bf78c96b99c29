//! Bounded request dispatcher.
//!
//! One dispatcher serves one applied configuration: a worker pool capped at
//! `maxActiveTasks` drains a FIFO queue capped at `maxQueuedTasks`. Submission
//! is synchronous and never blocks the receive path. When both pool and queue
//! are full, queries are answered with a `queryError` (a query is never
//! silently dropped); publish/notify envelopes are dropped with a warning.
//!
//! Handler errors and panics are contained per task; they never take down a
//! worker or the pool.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::config::DispatchLimits;
use crate::handler::SourceHandler;
use crate::protocol::{error_codes, Envelope, EnvelopeKind, WireMessage};
use crate::session::SessionSender;

/// An envelope waiting for a worker, stamped with its expiry.
pub struct WorkerTask {
    pub envelope: Envelope,
    pub deadline: Instant,
}

/// Counters shared across dispatcher rebuilds, surfaced in status output.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    answered: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`DispatchStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchCounts {
    /// Tasks a worker actually ran.
    pub dispatched: u64,
    /// Query replies sent, success and error alike.
    pub answered: u64,
    /// Envelopes refused at submission.
    pub rejected: u64,
    /// Fire-and-forget envelopes discarded.
    pub dropped: u64,
}

/// Fixed-size worker pool with a bounded overflow queue.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    limits: DispatchLimits,
    permits: Arc<Semaphore>,
    queue: Mutex<VecDeque<WorkerTask>>,
    handler: Arc<dyn SourceHandler>,
    outbound: SessionSender,
    stats: Arc<DispatchStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    draining: AtomicBool,
}

impl RequestDispatcher {
    pub fn new(
        limits: DispatchLimits,
        handler: Arc<dyn SourceHandler>,
        outbound: SessionSender,
        stats: Arc<DispatchStats>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_active_tasks));
        RequestDispatcher {
            inner: Arc::new(Inner {
                limits,
                permits,
                queue: Mutex::new(VecDeque::new()),
                handler,
                outbound,
                stats,
                workers: Mutex::new(Vec::new()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn limits(&self) -> &DispatchLimits {
        &self.inner.limits
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Route one envelope. Synchronous; never blocks, never fails.
    pub fn submit(&self, envelope: Envelope) {
        let inner = &self.inner;
        if inner.draining.load(Ordering::SeqCst) {
            inner.reject(
                envelope,
                error_codes::STOPPING,
                "connector instance is stopping",
            );
            return;
        }
        let deadline = Instant::now() + inner.limits.task_deadline;
        match Arc::clone(&inner.permits).try_acquire_owned() {
            Ok(permit) => self.spawn_worker(permit, WorkerTask { envelope, deadline }),
            Err(_) => {
                let mut queue = inner.queue.lock().unwrap();
                if queue.len() < inner.limits.max_queued_tasks {
                    queue.push_back(WorkerTask { envelope, deadline });
                    drop(queue);
                    // A worker may have gone idle between the failed acquire
                    // and the enqueue; re-check so the task cannot strand.
                    if let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() {
                        if let Some(task) = inner.next_task() {
                            self.spawn_worker(permit, task);
                        }
                    }
                } else {
                    drop(queue);
                    inner.reject(
                        envelope,
                        error_codes::SATURATED,
                        &format!(
                            "worker pool busy and queue full (capacity {})",
                            inner.limits.max_queued_tasks
                        ),
                    );
                }
            }
        }
    }

    /// Stop accepting work, answer whatever is still queued, then wait up to
    /// `grace` for in-flight tasks before aborting them.
    ///
    /// Queued queries are answered with a `queryError` immediately; tasks
    /// aborted at the end of the grace period do not reply.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        if inner.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        while let Some(task) = inner.next_task() {
            inner.reject(
                task.envelope,
                error_codes::STOPPING,
                "connector instance is stopping",
            );
        }
        let workers: Vec<JoinHandle<()>> = inner.workers.lock().unwrap().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        let aborts: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(workers)).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "dispatch grace expired, aborting in-flight tasks"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }

    fn spawn_worker(&self, permit: OwnedSemaphorePermit, task: WorkerTask) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut current = Some(task);
            while let Some(task) = current.take() {
                inner.run_task(task).await;
                current = inner.next_task();
            }
            drop(permit);
        });
        let mut workers = self.inner.workers.lock().unwrap();
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }
}

impl Inner {
    fn next_task(&self) -> Option<WorkerTask> {
        self.queue.lock().unwrap().pop_front()
    }

    async fn run_task(&self, task: WorkerTask) {
        let WorkerTask { envelope, deadline } = task;
        if Instant::now() >= deadline {
            self.expire(envelope);
            return;
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        match envelope.kind {
            EnvelopeKind::Query => self.run_query(envelope).await,
            EnvelopeKind::Publish | EnvelopeKind::Notify => {
                self.run_fire_and_forget(envelope).await
            }
            EnvelopeKind::Config => {
                // The router applies configuration itself; one ending up here
                // is a routing bug, not a handler concern.
                error!("config envelope reached the dispatcher, dropping");
            }
        }
    }

    async fn run_query(&self, envelope: Envelope) {
        let Some(reply_address) = envelope.reply_address.clone() else {
            warn!("query envelope without reply address, dropping");
            return;
        };
        let handler = Arc::clone(&self.handler);
        let outcome = AssertUnwindSafe(handler.on_query(envelope)).catch_unwind().await;
        let reply = match outcome {
            Ok(Ok(payload)) => WireMessage::QueryResponse {
                reply_address,
                payload,
            },
            Ok(Err(e)) => {
                warn!(handler = self.handler.name(), error = %e, "query handler failed");
                WireMessage::query_error(reply_address, error_codes::HANDLER_FAILURE, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(handler = self.handler.name(), message = %message, "query handler panicked");
                WireMessage::query_error(
                    reply_address,
                    error_codes::HANDLER_FAILURE,
                    format!("handler panicked: {message}"),
                )
            }
        };
        self.outbound.send(reply);
        self.stats.answered.fetch_add(1, Ordering::Relaxed);
    }

    async fn run_fire_and_forget(&self, envelope: Envelope) {
        let handler = Arc::clone(&self.handler);
        let outcome = AssertUnwindSafe(handler.on_publish(envelope)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(handler = self.handler.name(), error = %e, "publish handler failed")
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(handler = self.handler.name(), message = %message, "publish handler panicked");
            }
        }
    }

    /// A task that outlived its deadline in the queue.
    fn expire(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Query => {
                warn!("queued query expired before a worker picked it up");
                if let Some(reply_address) = envelope.reply_address {
                    self.outbound.send(WireMessage::query_error(
                        reply_address,
                        error_codes::TASK_EXPIRED,
                        "task expired in queue",
                    ));
                    self.stats.answered.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ => {
                warn!(kind = ?envelope.kind, "queued task expired, dropping");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Refuse an envelope outright, honoring the query reply guarantee.
    fn reject(&self, envelope: Envelope, code: &str, reason: &str) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        match envelope.kind {
            EnvelopeKind::Query => {
                if let Some(reply_address) = envelope.reply_address {
                    self.outbound
                        .send(WireMessage::query_error(reply_address, code, reason));
                    self.stats.answered.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!("rejected query carries no reply address");
                }
            }
            kind => {
                warn!(kind = ?kind, reason, "dropping envelope");
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
