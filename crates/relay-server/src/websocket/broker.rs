//! Per-user connection registry and fan-out delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::{ConnectionId, Message, UserId};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use crate::metrics::{BROADCASTS_TOTAL, BROADCAST_PRUNED_TOTAL, WS_CONNECTIONS_ACTIVE};

type ConnectionSet = HashMap<ConnectionId, Arc<ClientConnection>>;

/// Owns the registry of live connections keyed by user.
///
/// Every operation runs under one lock, so each observes the registry
/// either entirely before or entirely after any other. A user key exists
/// only while its connection set is non-empty.
pub struct ConnectionBroker {
    registry: Mutex<HashMap<UserId, ConnectionSet>>,
    broadcasts: AtomicU64,
}

impl ConnectionBroker {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            broadcasts: AtomicU64::new(0),
        }
    }

    /// Add `conn` to its user's set. Registering the same connection twice
    /// leaves one entry.
    pub fn register(&self, conn: Arc<ClientConnection>) {
        let mut registry = self.registry.lock();
        let set = registry.entry(conn.user_id().clone()).or_default();
        if set.insert(conn.id().clone(), conn.clone()).is_none() {
            gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        }
        debug!(conn_id = %conn.id(), user_id = %conn.user_id(), devices = set.len(), "connection registered");
    }

    /// Remove `conn` and close it. Returns whether it was still registered;
    /// removing an absent connection is a no-op apart from the close.
    pub fn unregister(&self, conn: &ClientConnection) -> bool {
        let removed = {
            let mut registry = self.registry.lock();
            remove_locked(&mut registry, conn.user_id(), conn.id()).is_some()
        };
        conn.close();
        if removed {
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
            debug!(conn_id = %conn.id(), user_id = %conn.user_id(), "connection unregistered");
        }
        removed
    }

    /// Deliver `message` to every connection of `user_id`.
    ///
    /// The message is serialized once. A connection whose queue rejects
    /// the frame is closed and removed before this returns. Returns the
    /// number of connections that accepted the frame; zero when the user
    /// has none.
    pub fn broadcast(&self, message: &Message, user_id: &UserId) -> usize {
        let _ = self.broadcasts.fetch_add(1, Ordering::Relaxed);
        counter!(BROADCASTS_TOTAL).increment(1);

        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to serialize message");
                return 0;
            }
        };

        let mut pruned = Vec::new();
        let delivered = {
            let mut registry = self.registry.lock();
            let Some(set) = registry.get(user_id) else {
                debug!(user_id = %user_id, "broadcast to user without connections");
                return 0;
            };

            let mut delivered = 0;
            for conn in set.values() {
                if conn.send(json.clone()) {
                    delivered += 1;
                } else {
                    pruned.push(conn.clone());
                }
            }
            for conn in &pruned {
                let _ = remove_locked(&mut registry, user_id, conn.id());
            }
            delivered
        };

        for conn in &pruned {
            warn!(conn_id = %conn.id(), user_id = %user_id, "broadcast write failed, dropping connection");
            conn.close();
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        }
        if !pruned.is_empty() {
            counter!(BROADCAST_PRUNED_TOTAL).increment(pruned.len() as u64);
        }
        debug!(user_id = %user_id, delivered, pruned = pruned.len(), kind = message.kind().as_str(), "broadcast");
        delivered
    }

    /// Total live connections.
    pub fn count_all(&self) -> usize {
        self.registry.lock().values().map(HashMap::len).sum()
    }

    /// Live connections for one user.
    pub fn count_for_user(&self, user_id: &UserId) -> usize {
        self.registry.lock().get(user_id).map_or(0, HashMap::len)
    }

    /// Number of users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// How many times [`broadcast`](Self::broadcast) has been called.
    pub fn broadcast_count(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    /// Whether `conn_id` is currently registered under `user_id`.
    pub fn contains(&self, user_id: &UserId, conn_id: &ConnectionId) -> bool {
        self.registry
            .lock()
            .get(user_id)
            .is_some_and(|set| set.contains_key(conn_id))
    }
}

impl Default for ConnectionBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove one connection and prune the user's set if it empties.
fn remove_locked(
    registry: &mut HashMap<UserId, ConnectionSet>,
    user_id: &UserId,
    conn_id: &ConnectionId,
) -> Option<Arc<ClientConnection>> {
    let set = registry.get_mut(user_id)?;
    let removed = set.remove(conn_id);
    if set.is_empty() {
        let _ = registry.remove(user_id);
    }
    removed
}
