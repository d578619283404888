//! WebSocket client connection state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{ConnectionId, UserId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// The connection's writer is gone; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// One live client. Outbound frames go through a bounded queue drained
/// by the connection's single writer task.
pub struct ClientConnection {
    id: ConnectionId,
    user_id: UserId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Cancelled when the connection is closed from any side.
    closed: CancellationToken,
    connected_at: Instant,
    /// Activity seen since the last heartbeat check.
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    /// Set while a chat reply is being relayed; the reader is not draining
    /// inbound frames then, so pongs go unseen.
    relaying: AtomicBool,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// `shutdown` closes the connection when cancelled.
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        tx: mpsc::Sender<Arc<String>>,
        shutdown: &CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            user_id,
            tx,
            closed: shutdown.child_token(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            relaying: AtomicBool::new(false),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Enqueue without waiting.
    ///
    /// Returns `false` if the connection is closed or its queue is full,
    /// and increments the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if !self.is_closed() && self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Enqueue, waiting for queue capacity. Frames sent this way are
    /// written in call order.
    pub async fn send_ordered(&self, message: Arc<String>) -> Result<(), ConnectionClosed> {
        if self.is_closed() {
            return Err(ConnectionClosed);
        }
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(ConnectionClosed),
            result = self.tx.send(message) => result.map_err(|_| ConnectionClosed),
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Ask the writer to send a Close frame and stop. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// A token cancelled when this connection closes.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.child_token()
    }

    /// Mark the connection as alive (pong or any frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Exempt the connection from heartbeat staleness until the guard drops.
    pub fn begin_relay(&self) -> RelayGuard<'_> {
        self.relaying.store(true, Ordering::Relaxed);
        RelayGuard(self)
    }

    pub fn is_relaying(&self) -> bool {
        self.relaying.load(Ordering::Relaxed)
    }

    /// Whether the heartbeat should drop this connection: nothing heard
    /// since the last check, for longer than `timeout`, and no reply in
    /// flight.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        if self.is_relaying() {
            return false;
        }
        !self.check_alive() && self.last_pong_elapsed() > timeout
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Ends a relay started by [`ClientConnection::begin_relay`]. The
/// connection counts as alive from the moment the relay ends.
#[must_use = "the relay ends when the guard is dropped"]
pub struct RelayGuard<'a>(&'a ClientConnection);

impl Drop for RelayGuard<'_> {
    fn drop(&mut self) {
        self.0.mark_alive();
        self.0.relaying.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) fn test_connection(
    user: impl Into<UserId>,
    capacity: usize,
) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
    let (tx, rx) = mpsc::channel(capacity);
    let conn = ClientConnection::new(ConnectionId::new(), user.into(), tx, &CancellationToken::new());
    (Arc::new(conn), rx)
}
