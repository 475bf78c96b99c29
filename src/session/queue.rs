//! Bounded outbound buffer between producers and the socket pump.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;

use crate::protocol::WireMessage;

/// Outbound frames waiting for the pump.
///
/// Frames queue up while the link is down and are flushed on reconnect.
/// When the queue is full the oldest frame is discarded so a dead link can
/// never pin unbounded memory; producers never block.
pub(crate) struct PendingQueue {
    capacity: usize,
    items: Mutex<VecDeque<WireMessage>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        PendingQueue {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn push(&self, message: WireMessage) {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.capacity {
                let evicted = items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    capacity = self.capacity,
                    evicted_op = evicted.as_ref().map(|m| m.op()).unwrap_or("?"),
                    "outbound queue full, dropping oldest frame"
                );
            }
            items.push_back(message);
        }
        self.notify.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<WireMessage> {
        self.items.lock().unwrap().pop_front()
    }

    /// Resolves when a push has happened since the last drain.
    pub(crate) async fn ready(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub(crate) fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cheap cloneable handle for sending frames to the platform.
///
/// Sends never block and never fail; frames ride the pending queue and go
/// out when the link allows.
#[derive(Clone)]
pub struct SessionSender {
    queue: Arc<PendingQueue>,
}

impl SessionSender {
    pub(crate) fn new(queue: Arc<PendingQueue>) -> Self {
        SessionSender { queue }
    }

    pub fn send(&self, message: WireMessage) {
        self.queue.push(message);
    }

    pub fn publish(&self, payload: Value) {
        self.send(WireMessage::Publish { payload });
    }

    pub fn notify(&self, payload: Value) {
        self.send(WireMessage::Notify { payload });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(n: u64) -> WireMessage {
        WireMessage::Notify {
            payload: json!({ "n": n }),
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let queue = PendingQueue::new(3);
        for n in 0..5 {
            queue.push(frame(n));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_count(), 2);
        // 0 and 1 were evicted
        assert_eq!(queue.pop(), Some(frame(2)));
        assert_eq!(queue.pop(), Some(frame(3)));
        assert_eq!(queue.pop(), Some(frame(4)));
        assert_eq!(queue.pop(), None);
    }

    #[tokio::test]
    async fn ready_resolves_after_push() {
        let queue = Arc::new(PendingQueue::new(8));
        let waiter = Arc::clone(&queue);
        let task = tokio::spawn(async move {
            waiter.ready().await;
            waiter.pop()
        });
        queue.push(frame(1));
        let popped = task.await.unwrap();
        assert_eq!(popped, Some(frame(1)));
    }
}
