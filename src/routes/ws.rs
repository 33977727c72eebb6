//! WebSocket handler — bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, admits the connection and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Frames queued by peers (relayed snapshots, voice notices) → forward
//!
//! Handler functions validate the request, call into `services::sync` or
//! `services::voice`, and return an `Outcome`. Fan-out to peers happens
//! inside the services; this layer only answers the sender.
//!
//! Replies are written to the socket before the loop polls the peer queue
//! again, so a join reply always precedes broadcasts enqueued after the
//! connection attached.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → admit → send `session:connected` with `connection_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Close or send failure → `sync::disconnect` unwinds every membership
//!
//! Malformed frames (bad JSON, unknown syscall, missing or invalid ids,
//! unknown role) are logged and dropped without a reply.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{Data, FRAME_BOARD_ID, Frame, Status, now_ms};
use crate::services::registry::ConnectionId;
use crate::services::session::{Role, Snapshot};
use crate::services::sync::{self, FRAME_SNAPSHOT};
use crate::services::voice::FRAME_PEER_ID;
use crate::state::AppState;

/// Identity used when the upstream authenticator supplied none.
pub const ANONYMOUS: &str = "anonymous";

/// Header the upstream authenticator may set instead of the `user` query parameter.
pub const USER_HEADER: &str = "x-user-id";

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions.
#[derive(Debug)]
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// Nothing goes back to the sender.
    Silent,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = resolve_identity(&params, &headers);
    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

/// Identity from the `user` query parameter, else the `x-user-id` header, else anonymous.
fn resolve_identity(params: &HashMap<String, String>, headers: &HeaderMap) -> String {
    if let Some(user) = params.get("user").map(|u| u.trim()).filter(|u| !u.is_empty()) {
        return user.to_owned();
    }
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map_or_else(|| ANONYMOUS.to_owned(), str::to_owned)
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: String) {
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);
    let conn = state.registry.admit(identity.clone(), client_tx.clone()).await;

    let welcome = Frame::request("session:connected", Data::new()).with_data("connection_id", conn.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        sync::disconnect(&state, conn).await;
        return;
    }

    info!(connection_id = %conn, %identity, "ws: client connected");

    'conn: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        for frame in process_inbound_text(&state, conn, &identity, &client_tx, text.as_str()).await {
                            if send_frame(&mut socket, &frame).await.is_err() {
                                break 'conn;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(info) = state.registry.info(conn).await {
        info!(
            connection_id = %conn,
            identity = %info.identity,
            boards = info.boards.len(),
            connected_ms = now_ms() - info.connected_at_ms,
            "ws: client disconnecting"
        );
    }
    sync::disconnect(&state, conn).await;
    info!(connection_id = %conn, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive dispatch directly.
async fn process_inbound_text(
    state: &AppState,
    conn: ConnectionId,
    identity: &str,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(connection_id = %conn, error = %e, "ws: invalid inbound frame dropped");
            return vec![];
        }
    };

    if req.status != Status::Request {
        debug!(connection_id = %conn, syscall = %req.syscall, status = ?req.status, "ws: non-request frame ignored");
        return vec![];
    }

    // Stamp the upstream identity as `from`.
    req.from = Some(identity.to_owned());
    debug!(connection_id = %conn, id = %req.id, syscall = %req.syscall, "ws: recv frame");

    let result = match req.prefix() {
        "board" => handle_board(state, conn, identity, client_tx, &req).await,
        "voice" => handle_voice(state, conn, client_tx, &req).await,
        prefix => {
            warn!(connection_id = %conn, %prefix, syscall = %req.syscall, "ws: unknown syscall prefix dropped");
            Ok(Outcome::Silent)
        }
    };

    match result {
        Ok(Outcome::Reply(data)) => {
            // A reply naming a board is tagged with that id, so a join by code comes back under the full id.
            let tag = data.get(FRAME_BOARD_ID).and_then(|v| v.as_str()).map(str::to_owned);
            let reply = req.done_with(data);
            match tag {
                Some(board_id) => vec![reply.with_board_id(board_id)],
                None => vec![reply],
            }
        }
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

/// Validated board id from the frame, or `None` (logged) if missing or invalid.
fn require_board_id<'a>(req: &'a Frame, conn: ConnectionId) -> Option<&'a str> {
    match req.board_id() {
        Some(board_id) if sync::valid_board_id(board_id) => Some(board_id),
        Some(_) => {
            warn!(connection_id = %conn, syscall = %req.syscall, "ws: invalid board_id, frame dropped");
            None
        }
        None => {
            warn!(connection_id = %conn, syscall = %req.syscall, "ws: missing board_id, frame dropped");
            None
        }
    }
}

/// Snapshot carried in `data.snapshot`. JSON `null` counts as absent.
fn snapshot_field(req: &Frame) -> Option<Snapshot> {
    match req.data.get(FRAME_SNAPSHOT) {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => Some(Snapshot::from_json(value)),
    }
}

// =============================================================================
// BOARD HANDLERS
// =============================================================================

async fn handle_board(
    state: &AppState,
    conn: ConnectionId,
    identity: &str,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    if req.op() == "resolve" {
        let Some(code) = req.str_field("code") else {
            warn!(connection_id = %conn, "ws: board:resolve without code dropped");
            return Ok(Outcome::Silent);
        };
        return match sync::resolve_join_code(state, code).await {
            Ok(board_id) => {
                let mut data = Data::new();
                data.insert(FRAME_BOARD_ID.into(), serde_json::json!(board_id));
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        };
    }

    let Some(board_id) = require_board_id(req, conn) else {
        return Ok(Outcome::Silent);
    };

    match req.op() {
        "join" => {
            let role = match req.str_field("role") {
                None => Role::Host,
                Some(raw) => {
                    let Some(role) = Role::parse(raw) else {
                        warn!(connection_id = %conn, %board_id, role = raw, "ws: unknown role, join dropped");
                        return Ok(Outcome::Silent);
                    };
                    role
                }
            };

            match sync::join_board(state, conn, client_tx.clone(), board_id, role, snapshot_field(req)).await {
                Ok(joined) => {
                    let mut data = Data::new();
                    data.insert(FRAME_BOARD_ID.into(), serde_json::json!(joined.board_id));
                    data.insert(FRAME_SNAPSHOT.into(), Snapshot::to_json(joined.snapshot.as_ref()));
                    data.insert("join_code".into(), serde_json::json!(sync::join_code_of(&joined.board_id)));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "data" => {
            let Some(snapshot) = snapshot_field(req) else {
                warn!(connection_id = %conn, %board_id, "ws: board:data without snapshot dropped");
                return Ok(Outcome::Silent);
            };
            match sync::mutate_board(state, conn, identity, board_id, snapshot).await {
                Ok(()) => Ok(Outcome::Silent),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "leave" => {
            sync::leave_board(state, conn, board_id).await;
            Ok(Outcome::Done)
        }
        "save" => {
            let preview_image = req.str_field("preview_image");
            match sync::save_board(state, board_id, snapshot_field(req), preview_image).await {
                Ok(()) => {
                    let mut data = Data::new();
                    data.insert(FRAME_BOARD_ID.into(), serde_json::json!(board_id));
                    data.insert("saved".into(), serde_json::json!(true));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "autosave" => match sync::request_autosave(state, conn, req, board_id).await {
            Ok(delay) => {
                let mut data = Data::new();
                data.insert(FRAME_BOARD_ID.into(), serde_json::json!(board_id));
                data.insert("delay_ms".into(), serde_json::json!(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)));
                Ok(Outcome::Reply(data))
            }
            Err(e) => Err(req.error_from(&e)),
        },
        op => {
            warn!(connection_id = %conn, %op, "ws: unknown board op dropped");
            Ok(Outcome::Silent)
        }
    }
}

// =============================================================================
// VOICE HANDLERS
// =============================================================================

async fn handle_voice(
    state: &AppState,
    conn: ConnectionId,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(board_id) = require_board_id(req, conn) else {
        return Ok(Outcome::Silent);
    };
    let Some(peer_id) = req.str_field(FRAME_PEER_ID).filter(|p| !p.is_empty()) else {
        warn!(connection_id = %conn, %board_id, syscall = %req.syscall, "ws: missing peer_id, frame dropped");
        return Ok(Outcome::Silent);
    };

    match req.op() {
        "join" => {
            let peers = state.voice.join(board_id, peer_id, conn, client_tx.clone()).await;
            let mut data = Data::new();
            data.insert(FRAME_BOARD_ID.into(), serde_json::json!(board_id));
            data.insert("peers".into(), serde_json::json!(peers));
            Ok(Outcome::Reply(data))
        }
        "leave" => {
            state.voice.leave(board_id, peer_id, conn).await;
            Ok(Outcome::Silent)
        }
        op => {
            warn!(connection_id = %conn, %op, "ws: unknown voice op dropped");
            Ok(Outcome::Silent)
        }
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.str_field("code").unwrap_or("-");
        let message = frame.str_field("message").unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
