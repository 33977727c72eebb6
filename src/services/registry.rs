//! Connection registry — every live socket and the boards it joined.
//!
//! DESIGN
//! ======
//! A connection is admitted on WebSocket upgrade and removed exactly once on
//! close. The registry only does bookkeeping: it owns the identity the
//! upstream authenticator supplied, the outbound channel, and the set of
//! boards the connection attached to so disconnect can unwind them without
//! scanning every session. Voice presence keeps its own reverse index.
//!
//! `remove` returning `None` for an unknown id is what makes disconnect
//! idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::warn;
use uuid::Uuid;

use crate::frame::{Frame, now_ms};

/// Transport-level connection identifier, one per open socket.
pub type ConnectionId = Uuid;

/// Bookkeeping for one live connection.
struct Connection {
    identity: String,
    tx: mpsc::Sender<Frame>,
    boards: HashSet<String>,
    connected_at_ms: i64,
}

/// Public view of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub identity: String,
    pub boards: Vec<String>,
    pub connected_at_ms: i64,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection. Always succeeds; starts with no memberships.
    pub async fn admit(&self, identity: impl Into<String>, tx: mpsc::Sender<Frame>) -> ConnectionId {
        let id = Uuid::new_v4();
        let connection = Connection { identity: identity.into(), tx, boards: HashSet::new(), connected_at_ms: now_ms() };
        self.inner.write().await.insert(id, connection);
        id
    }

    /// Record that a connection attached to a board. No-op for unknown connections.
    pub async fn record_join(&self, id: ConnectionId, board_id: &str) {
        if let Some(conn) = self.inner.write().await.get_mut(&id) {
            conn.boards.insert(board_id.to_owned());
        }
    }

    /// Record that a connection detached from a board.
    pub async fn record_leave(&self, id: ConnectionId, board_id: &str) {
        if let Some(conn) = self.inner.write().await.get_mut(&id) {
            conn.boards.remove(board_id);
        }
    }

    /// Remove a connection and return the boards it was attached to.
    ///
    /// Returns `None` if the connection was already removed.
    pub async fn remove(&self, id: ConnectionId) -> Option<Vec<String>> {
        let conn = self.inner.write().await.remove(&id)?;
        let mut boards: Vec<String> = conn.boards.into_iter().collect();
        boards.sort();
        Some(boards)
    }

    /// Best-effort delivery of a frame to one connection.
    ///
    /// Returns `false` if the connection is gone or its queue is full.
    pub async fn send_to(&self, id: ConnectionId, frame: Frame) -> bool {
        let connections = self.inner.read().await;
        let Some(conn) = connections.get(&id) else {
            return false;
        };
        match conn.tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "registry: direct send dropped");
                false
            }
        }
    }

    pub async fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let connections = self.inner.read().await;
        let conn = connections.get(&id)?;
        let mut boards: Vec<String> = conn.boards.iter().cloned().collect();
        boards.sort();
        Some(ConnectionInfo { identity: conn.identity.clone(), boards, connected_at_ms: conn.connected_at_ms })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
