//! Observer connection state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_core::ObserverId;
use tokio::sync::mpsc;

/// One connected observer, as seen by the broadcaster.
///
/// Holds only the sending half of the observer's outbound queue; the
/// session task owns the socket.
#[derive(Debug)]
pub struct ObserverConnection {
    pub id: ObserverId,
    tx: mpsc::Sender<Arc<String>>,
    pub connected_at: Instant,
    /// Count of messages dropped due to a full or closed queue.
    pub dropped_messages: AtomicU64,
}

impl ObserverConnection {
    pub fn new(id: ObserverId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame for the observer without waiting.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Whether the session task is still draining the queue.
    pub fn is_active(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
