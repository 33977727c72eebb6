//! Synchronization handler — join, mutate, leave, save, and disconnect.
//!
//! DESIGN
//! ======
//! Each operation is a free function over `AppState`, called by the
//! WebSocket dispatcher once the inbound frame has been validated. The
//! functions compose the session table, connection registry, voice presence,
//! and persistence adapter; none of them holds a table or session lock
//! across store I/O.
//!
//! Viewers may enter a board by its join code, the last six characters of
//! the board id. Hosts always address a board by its full id.
//!
//! ERROR HANDLING
//! ==============
//! `SyncError` carries the failures a requester is told about: an unknown
//! join code, a mutation refused by policy, a save with nothing to save, and
//! persistence failures. Hydration failures on join are logged and the
//! session starts empty instead.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::frame::{Data, ErrorCode, FRAME_BOARD_ID, Frame};
use crate::services::registry::ConnectionId;
use crate::services::session::{Detached, Mutation, Role, Snapshot};
use crate::state::AppState;
use crate::store::StoreError;

/// Number of trailing characters of a board id that form its join code.
pub const JOIN_CODE_LEN: usize = 6;

/// Longest accepted board id, in characters.
pub const MAX_BOARD_ID_LEN: usize = 256;

/// Frame data key for a board snapshot.
pub const FRAME_SNAPSHOT: &str = "snapshot";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no live board matches join code {code}")]
    JoinCodeNotFound { code: String },
    #[error("mutation of board {board_id} not permitted for this connection")]
    MutationForbidden { board_id: String },
    #[error("board {board_id} is not live")]
    BoardNotLive { board_id: String },
    #[error("board {board_id} has no snapshot to save")]
    NothingToSave { board_id: String },
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::JoinCodeNotFound { .. } => "E_JOIN_CODE_NOT_FOUND",
            Self::MutationForbidden { .. } => "E_MUTATION_FORBIDDEN",
            Self::BoardNotLive { .. } => "E_BOARD_NOT_LIVE",
            Self::NothingToSave { .. } => "E_NOTHING_TO_SAVE",
            Self::Persistence(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Persistence(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct Joined {
    /// Full board id, even when the caller joined by code.
    pub board_id: String,
    pub snapshot: Option<Snapshot>,
    pub created: bool,
    pub resumed: bool,
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Board ids are opaque but must be non-empty, bounded, and free of control characters.
#[must_use]
pub fn valid_board_id(board_id: &str) -> bool {
    !board_id.is_empty()
        && board_id.chars().count() <= MAX_BOARD_ID_LEN
        && !board_id.chars().any(char::is_control)
}

/// Whether `candidate` has the shape of a join code.
#[must_use]
pub fn is_join_code(candidate: &str) -> bool {
    candidate.chars().count() == JOIN_CODE_LEN
}

/// The join code of a board id: its last `JOIN_CODE_LEN` characters.
#[must_use]
pub fn join_code_of(board_id: &str) -> &str {
    let skip = board_id.chars().count().saturating_sub(JOIN_CODE_LEN);
    board_id.char_indices().nth(skip).map_or(board_id, |(idx, _)| &board_id[idx..])
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Attach a connection to a board and return the board's current snapshot.
///
/// `seed` is only honored for hosts creating a new session.
///
/// # Errors
///
/// Returns `JoinCodeNotFound` if a viewer addressed a board by join code and
/// no live session matches.
pub async fn join_board(
    state: &AppState,
    conn: ConnectionId,
    tx: mpsc::Sender<Frame>,
    board_id: &str,
    role: Role,
    seed: Option<Snapshot>,
) -> Result<Joined, SyncError> {
    let mut target = board_id.to_owned();
    if role == Role::Viewer && is_join_code(board_id) && !state.sessions.contains(board_id).await {
        target = state
            .sessions
            .resolve_join_code(board_id)
            .await
            .ok_or_else(|| SyncError::JoinCodeNotFound { code: board_id.to_owned() })?;
        debug!(code = %board_id, board_id = %target, "sync: join code resolved");
    }

    let mut seed = if role == Role::Host { seed } else { None };
    if seed.is_none() && state.config.hydrate_on_join && !state.sessions.contains(&target).await {
        seed = hydrate(state, &target).await;
    }

    let attached = state.sessions.attach(&target, conn, role, tx, seed).await;
    state.registry.record_join(conn, &target).await;

    info!(
        board_id = %target,
        connection_id = %conn,
        role = role.as_str(),
        members = attached.members,
        created = attached.created,
        resumed = attached.resumed,
        "sync: joined board"
    );
    Ok(Joined { board_id: attached.board_id, snapshot: attached.snapshot, created: attached.created, resumed: attached.resumed })
}

async fn hydrate(state: &AppState, board_id: &str) -> Option<Snapshot> {
    match state.store.load(board_id).await {
        Ok(Some(stored)) => {
            info!(
                %board_id,
                bytes = stored.snapshot.as_str().len(),
                updated_at_ms = stored.updated_at_ms,
                "sync: hydrated board from store"
            );
            Some(stored.snapshot)
        }
        Ok(None) => None,
        Err(e) => {
            error!(%board_id, error = %e, "sync: hydration failed; starting empty");
            None
        }
    }
}

/// Detach a connection from a board. Returns `false` if it was not attached.
pub async fn leave_board(state: &AppState, conn: ConnectionId, board_id: &str) -> bool {
    let detached = state.sessions.detach(board_id, conn).await;
    state.registry.record_leave(conn, board_id).await;
    match detached {
        Detached::NotMember => {
            debug!(%board_id, connection_id = %conn, "sync: leave for board not joined");
            false
        }
        Detached::Remaining(remaining) => {
            info!(%board_id, connection_id = %conn, remaining, "sync: left board");
            true
        }
        Detached::Emptied => {
            info!(%board_id, connection_id = %conn, remaining = 0, "sync: left board");
            true
        }
    }
}

/// Unwind every board membership and voice entry of a connection.
///
/// Idempotent: the registry hands out a connection's board list only once.
pub async fn disconnect(state: &AppState, conn: ConnectionId) {
    let Some(boards) = state.registry.remove(conn).await else {
        debug!(connection_id = %conn, "sync: disconnect for connection already removed");
        return;
    };
    for board_id in &boards {
        state.sessions.detach(board_id, conn).await;
    }
    let voice_entries = state.voice.remove_connection(conn).await;
    info!(connection_id = %conn, boards = boards.len(), voice_entries, "sync: connection unwound");
}

// =============================================================================
// MUTATE
// =============================================================================

/// Replace a board's snapshot and relay it to every other member.
///
/// The originator gets no echo. `from` is stamped on the relayed frame.
///
/// # Errors
///
/// Returns `MutationForbidden` if the configured policy refuses the mutation.
pub async fn mutate_board(
    state: &AppState,
    conn: ConnectionId,
    from: &str,
    board_id: &str,
    snapshot: Snapshot,
) -> Result<(), SyncError> {
    let mut data = Data::new();
    data.insert(FRAME_BOARD_ID.into(), serde_json::json!(board_id));
    data.insert(FRAME_SNAPSHOT.into(), Snapshot::to_json(Some(&snapshot)));
    let relay = Frame::request("board:data", data)
        .with_board_id(board_id)
        .with_from(from);

    match state
        .sessions
        .mutate(board_id, conn, snapshot, state.config.mutation_policy, &relay)
        .await
    {
        Mutation::Applied { delivered, dropped, created } => {
            debug!(%board_id, connection_id = %conn, delivered, dropped, created, "sync: mutation applied");
            Ok(())
        }
        Mutation::Rejected { role } => {
            warn!(%board_id, connection_id = %conn, role = role.map_or("none", Role::as_str), "sync: mutation rejected by policy");
            Err(SyncError::MutationForbidden { board_id: board_id.to_owned() })
        }
    }
}

// =============================================================================
// JOIN CODES
// =============================================================================

/// Resolve a join code to the full id of a live board.
///
/// # Errors
///
/// Returns `JoinCodeNotFound` if the code is malformed or no live board matches.
pub async fn resolve_join_code(state: &AppState, code: &str) -> Result<String, SyncError> {
    if !is_join_code(code) {
        return Err(SyncError::JoinCodeNotFound { code: code.to_owned() });
    }
    state
        .sessions
        .resolve_join_code(code)
        .await
        .ok_or_else(|| SyncError::JoinCodeNotFound { code: code.to_owned() })
}

// =============================================================================
// SAVE / AUTOSAVE
// =============================================================================

/// Explicit save: the supplied snapshot, or else the live one, goes to the store.
///
/// # Errors
///
/// Returns `NothingToSave` if neither is available and `Persistence` if the
/// store fails. Session state is untouched either way.
pub async fn save_board(
    state: &AppState,
    board_id: &str,
    snapshot: Option<Snapshot>,
    preview_image: Option<&str>,
) -> Result<(), SyncError> {
    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => state
            .sessions
            .view(board_id)
            .await
            .and_then(|view| view.snapshot)
            .ok_or_else(|| SyncError::NothingToSave { board_id: board_id.to_owned() })?,
    };

    if let Err(e) = state.store.save(board_id, &snapshot, preview_image).await {
        error!(%board_id, error = %e, "sync: save failed");
        return Err(e.into());
    }
    info!(%board_id, bytes = snapshot.as_str().len(), preview = preview_image.is_some(), "sync: board saved");
    Ok(())
}

/// (Re)arm a board's debounced auto-save and return the debounce delay.
///
/// A failed auto-save is reported to `conn` as an error reply to `request`,
/// provided the connection is still open.
///
/// # Errors
///
/// Returns `BoardNotLive` if no session exists for `board_id`.
pub async fn request_autosave(
    state: &AppState,
    conn: ConnectionId,
    request: &Frame,
    board_id: &str,
) -> Result<Duration, SyncError> {
    let delay = state.config.autosave_debounce;
    let store = state.store.clone();
    let registry = state.registry.clone();
    let request = request.clone();
    let owned_board_id = board_id.to_owned();

    let armed = state
        .sessions
        .debounce_autosave(board_id, delay, move |snapshot| async move {
            match store.save(&owned_board_id, &snapshot, None).await {
                Ok(()) => info!(board_id = %owned_board_id, bytes = snapshot.as_str().len(), "sync: autosaved board"),
                Err(e) => {
                    error!(board_id = %owned_board_id, error = %e, "sync: autosave failed");
                    let err = SyncError::from(e);
                    if !registry.send_to(conn, request.error_from(&err)).await {
                        debug!(board_id = %owned_board_id, connection_id = %conn, "sync: autosave failure not delivered");
                    }
                }
            }
        })
        .await;

    if !armed {
        return Err(SyncError::BoardNotLive { board_id: board_id.to_owned() });
    }
    debug!(%board_id, connection_id = %conn, delay_ms = delay.as_millis(), "sync: autosave armed");
    Ok(delay)
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
