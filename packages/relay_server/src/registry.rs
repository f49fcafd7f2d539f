//! Connection registry: user id → live connection handle.
//!
//! Connections are served in parallel, so the map sits behind an `RwLock`.
//! Broadcasts clone the recipient handles under the read lock and write to
//! them after releasing it; a handle removed before the snapshot is taken is
//! simply not written to.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// Unique identifier for one accepted connection.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a frame could not be queued for a recipient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("connection {0} is not keeping up")]
    Full(ConnectionId),
}

/// Write side of a connection. The writer task owning the stream drains the
/// other end of the channel.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    conn_id: ConnectionId,
    user_id: String,
    tx: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(conn_id: ConnectionId, user_id: impl Into<String>, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            conn_id,
            user_id: user_id.into(),
            tx,
        }
    }

    /// A handle plus the receiver its writer task should drain.
    pub fn channel(
        conn_id: ConnectionId,
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(conn_id, user_id, tx), rx)
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue an encoded frame without waiting.
    pub fn send(&self, frame: Bytes) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.conn_id),
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full(self.conn_id),
        })
    }
}

/// Result of a fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Registry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register `handle` under its user id.
    ///
    /// Last write wins: an existing entry for the same id is replaced and
    /// returned. The displaced connection stays open but no longer receives
    /// broadcasts.
    pub async fn insert(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user_id = handle.user_id.clone();
        let displaced = self.connections.write().await.insert(user_id, handle);
        if let Some(ref old) = displaced {
            debug!(user_id = %old.user_id, conn_id = %old.conn_id, "registry slot overwritten");
        }
        displaced
    }

    pub async fn remove(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.write().await.remove(user_id)
    }

    /// Remove `user_id` only if it still maps to `conn_id`.
    ///
    /// Returns false when the slot was already taken over by a later
    /// connection (or is gone), leaving it untouched.
    pub async fn remove_connection(&self, user_id: &str, conn_id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user_id) {
            Some(handle) if handle.conn_id == conn_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(user_id).cloned()
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.connections.read().await.contains_key(user_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn user_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Queue `frame` on every connection except `sender_id`'s.
    ///
    /// A failed recipient is logged and counted; it never stops delivery to
    /// the rest.
    pub async fn broadcast_except(&self, sender_id: &str, frame: Bytes) -> BroadcastReport {
        let recipients: Vec<ConnectionHandle> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(user_id, _)| user_id.as_str() != sender_id)
            .map(|(_, handle)| handle.clone())
            .collect();

        let mut report = BroadcastReport::default();
        for handle in recipients {
            match handle.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(user_id = %handle.user_id, error = %e, "broadcast delivery failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
