//! Voice presence — per-board signaling-id sets and arrival/departure notices.
//!
//! DESIGN
//! ======
//! The relay never touches media. It keeps, per board, the ordered list of
//! signaling ids currently in the voice channel and tells members about
//! arrivals and departures so clients can dial each other directly. A new
//! arrival is told about everyone already present and everyone present is
//! told about the arrival, so every pair gets at least one dial.
//!
//! A signaling id lives in at most one board's set. Joining another board
//! moves it, which reads as a departure on the old board.
//!
//! Notices are enqueued with `try_send` while the presence lock is held, so
//! each member sees arrivals and departures in the order they happened.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::frame::{Data, FRAME_BOARD_ID, Frame};
use crate::services::registry::ConnectionId;

/// Data key carrying a signaling id.
pub const FRAME_PEER_ID: &str = "peer_id";

struct VoicePeer {
    peer_id: String,
    conn: ConnectionId,
    tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct VoiceState {
    /// board id → peers in arrival order.
    rooms: HashMap<String, Vec<VoicePeer>>,
    /// signaling id → board id it is registered under.
    owners: HashMap<String, String>,
    /// connection → signaling ids it registered.
    by_connection: HashMap<ConnectionId, Vec<String>>,
}

impl VoiceState {
    /// Drop a signaling id from whatever board holds it and notify that board.
    fn unregister(&mut self, peer_id: &str) -> Option<String> {
        let board_id = self.owners.remove(peer_id)?;
        let mut removed_conn = None;
        if let Some(room) = self.rooms.get_mut(&board_id) {
            if let Some(pos) = room.iter().position(|p| p.peer_id == peer_id) {
                removed_conn = Some(room.remove(pos).conn);
            }
            notify(room, &notice("voice:left", &board_id, peer_id));
            if room.is_empty() {
                self.rooms.remove(&board_id);
            }
        }
        if let Some(conn) = removed_conn {
            if let Some(ids) = self.by_connection.get_mut(&conn) {
                ids.retain(|id| id != peer_id);
                if ids.is_empty() {
                    self.by_connection.remove(&conn);
                }
            }
        }
        Some(board_id)
    }
}

fn notice(syscall: &str, board_id: &str, peer_id: &str) -> Frame {
    let mut data = Data::new();
    data.insert(FRAME_BOARD_ID.into(), serde_json::json!(board_id));
    data.insert(FRAME_PEER_ID.into(), serde_json::json!(peer_id));
    Frame::request(syscall, data).with_board_id(board_id)
}

fn notify(peers: &[VoicePeer], frame: &Frame) {
    for peer in peers {
        if let Err(e) = peer.tx.try_send(frame.clone()) {
            warn!(peer_id = %peer.peer_id, connection_id = %peer.conn, error = %e, "voice: notice dropped");
        }
    }
}

#[derive(Clone, Default)]
pub struct VoicePresence {
    inner: Arc<RwLock<VoiceState>>,
}

impl VoicePresence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer_id` on `board_id` for connection `conn`.
    ///
    /// Returns the signaling ids already present, in arrival order. Every
    /// one of them receives `voice:joined`. Re-joining the same board is
    /// treated as a fresh arrival.
    pub async fn join(&self, board_id: &str, peer_id: &str, conn: ConnectionId, tx: mpsc::Sender<Frame>) -> Vec<String> {
        let mut state = self.inner.write().await;

        if let Some(previous) = state.unregister(peer_id) {
            if previous != board_id {
                info!(%peer_id, from = %previous, to = %board_id, "voice: peer moved boards");
            }
        }

        let room = state.rooms.entry(board_id.to_owned()).or_default();
        let peers: Vec<String> = room.iter().map(|p| p.peer_id.clone()).collect();
        notify(room, &notice("voice:joined", board_id, peer_id));
        room.push(VoicePeer { peer_id: peer_id.to_owned(), conn, tx });

        state.owners.insert(peer_id.to_owned(), board_id.to_owned());
        state.by_connection.entry(conn).or_default().push(peer_id.to_owned());

        info!(%board_id, %peer_id, connection_id = %conn, others = peers.len(), "voice: joined");
        peers
    }

    /// Remove `peer_id` from `board_id` and notify the remaining members.
    ///
    /// Only the connection that registered the id may remove it. Returns
    /// `false` (and does nothing) otherwise.
    pub async fn leave(&self, board_id: &str, peer_id: &str, conn: ConnectionId) -> bool {
        let mut state = self.inner.write().await;
        let owned = state.owners.get(peer_id).is_some_and(|b| b == board_id)
            && state
                .by_connection
                .get(&conn)
                .is_some_and(|ids| ids.iter().any(|id| id == peer_id));
        if !owned {
            debug!(%board_id, %peer_id, connection_id = %conn, "voice: leave for unknown peer ignored");
            return false;
        }

        state.unregister(peer_id);
        info!(%board_id, %peer_id, connection_id = %conn, "voice: left");
        true
    }

    /// Remove every signaling id a connection registered. Returns how many were removed.
    pub async fn remove_connection(&self, conn: ConnectionId) -> usize {
        let mut state = self.inner.write().await;
        let Some(peer_ids) = state.by_connection.remove(&conn) else {
            return 0;
        };
        for peer_id in &peer_ids {
            if let Some(board_id) = state.unregister(peer_id) {
                info!(%board_id, %peer_id, connection_id = %conn, "voice: left on disconnect");
            }
        }
        peer_ids.len()
    }

    /// Signaling ids present on a board, in arrival order.
    #[cfg(test)]
    pub async fn peers(&self, board_id: &str) -> Vec<String> {
        let state = self.inner.read().await;
        state
            .rooms
            .get(board_id)
            .map(|room| room.iter().map(|p| p.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of boards with at least one peer in voice.
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}

#[cfg(test)]
#[path = "voice_test.rs"]
mod tests;
