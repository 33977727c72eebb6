//! Board session table — live boards, their snapshots, and attached members.
//!
//! DESIGN
//! ======
//! The table maps a board id to an `Arc<Mutex<BoardSession>>`. The map lock
//! is taken in read mode for every per-session operation and in write mode
//! only to create or evict a session. Each session's own mutex is the single
//! apply point for that board: join, mutate, and leave are serialized there,
//! and mutation fan-out is enqueued while it is held. Per-connection queues
//! are FIFO, so every member observes snapshots in apply order. Sessions on
//! different boards never contend beyond the map read lock.
//!
//! LIFECYCLE
//! =========
//! absent → ACTIVE (first join) → GRACE_PERIOD (last member detached, timer
//! armed) → evicted (timer fired). A join during the grace period aborts the
//! timer. Every transition bumps `epoch`, so a timer that already woke up
//! cannot evict a session that was revived in the meantime.
//!
//! Lock order is always map → session. Nothing here awaits network I/O while
//! holding either lock; fan-out uses `try_send`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::{Frame, now_ms};
use crate::services::registry::ConnectionId;

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Complete serialized board state. Opaque to the relay, cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    text: Arc<str>,
    /// `text` is the compact JSON of a non-string wire value and goes back out as that value.
    structured: bool,
}

impl Snapshot {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_structured(&self) -> bool {
        self.structured
    }

    /// Snapshot whose text is JSON to be relayed as a JSON value, not a string.
    #[must_use]
    pub fn from_json_text(text: impl Into<Arc<str>>) -> Self {
        Self { text: text.into(), structured: true }
    }

    /// Snapshot from a wire value: strings are taken verbatim, anything else
    /// is kept as its compact JSON text and relayed back as the same value.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => Self::from(text.as_str()),
            other => Self::from_json_text(other.to_string()),
        }
    }

    /// Wire form of an optional snapshot; the empty default is `null`.
    #[must_use]
    pub fn to_json(snapshot: Option<&Snapshot>) -> serde_json::Value {
        let Some(snapshot) = snapshot else {
            return serde_json::Value::Null;
        };
        if snapshot.structured {
            if let Ok(value) = serde_json::from_str(&snapshot.text) {
                return value;
            }
        }
        serde_json::Value::String(snapshot.text.to_string())
    }
}

impl From<&str> for Snapshot {
    fn from(text: &str) -> Self {
        Self { text: Arc::from(text), structured: false }
    }
}

impl From<String> for Snapshot {
    fn from(text: String) -> Self {
        Self { text: Arc::from(text), structured: false }
    }
}

// =============================================================================
// ROLES & POLICY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Viewer,
}

impl Role {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host" => Some(Self::Host),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Viewer => "viewer",
        }
    }
}

/// Who may replace a board's snapshot.
///
/// Roles are advisory under `Permissive`: any connection, attached or not,
/// may mutate. `HostOnly` restricts mutation to connections attached as host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPolicy {
    Permissive,
    HostOnly,
}

impl MutationPolicy {
    /// `role` is the mutator's role on the board, `None` if not attached.
    #[must_use]
    pub fn permits(self, role: Option<Role>) -> bool {
        match self {
            Self::Permissive => true,
            Self::HostOnly => role == Some(Role::Host),
        }
    }
}

// =============================================================================
// BOARD SESSION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    GracePeriod,
}

struct Member {
    role: Role,
    tx: mpsc::Sender<Frame>,
}

/// Per-board live state.
pub struct BoardSession {
    board_id: String,
    /// `None` is the empty default snapshot.
    snapshot: Option<Snapshot>,
    members: HashMap<ConnectionId, Member>,
    created_at_ms: i64,
    last_mutation_ms: Option<i64>,
    /// Table-wide sequence of the last mutation (or creation). Orders join-code collisions.
    seq: u64,
    epoch: u64,
    grace_timer: Option<JoinHandle<()>>,
    autosave: Option<JoinHandle<()>>,
}

impl BoardSession {
    fn new(board_id: &str, snapshot: Option<Snapshot>, seq: u64) -> Self {
        Self {
            board_id: board_id.to_owned(),
            snapshot,
            members: HashMap::new(),
            created_at_ms: now_ms(),
            last_mutation_ms: None,
            seq,
            epoch: 0,
            grace_timer: None,
            autosave: None,
        }
    }

    fn phase(&self) -> SessionPhase {
        if self.members.is_empty() { SessionPhase::GracePeriod } else { SessionPhase::Active }
    }

    fn attach(&mut self, conn: ConnectionId, role: Role, tx: mpsc::Sender<Frame>, created: bool) -> Attached {
        let resumed = !created && self.members.is_empty();
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
        if self.members.is_empty() {
            self.epoch += 1;
        }
        self.members.insert(conn, Member { role, tx });

        Attached {
            board_id: self.board_id.clone(),
            snapshot: self.snapshot.clone(),
            created,
            resumed,
            members: self.members.len(),
        }
    }

    fn apply(&mut self, from: ConnectionId, snapshot: Snapshot, policy: MutationPolicy, frame: &Frame, seq: u64) -> Mutation {
        let role = self.members.get(&from).map(|m| m.role);
        if !policy.permits(role) {
            return Mutation::Rejected { role };
        }

        self.snapshot = Some(snapshot);
        self.last_mutation_ms = Some(now_ms());
        self.seq = seq;

        let (delivered, dropped) = fan_out(&self.board_id, &self.members, frame, Some(from));
        Mutation::Applied { delivered, dropped, created: false }
    }

    fn view(&self) -> SessionView {
        SessionView {
            snapshot: self.snapshot.clone(),
            phase: self.phase(),
            members: self.members.len(),
            last_mutation_ms: self.last_mutation_ms,
        }
    }
}

/// Enqueue a frame to every member except `exclude`. Returns (delivered, dropped).
fn fan_out(
    board_id: &str,
    members: &HashMap<ConnectionId, Member>,
    frame: &Frame,
    exclude: Option<ConnectionId>,
) -> (usize, usize) {
    let mut delivered = 0;
    let mut dropped = 0;
    for (conn, member) in members {
        if exclude == Some(*conn) {
            continue;
        }
        // Best-effort: a full or closed queue only costs that member this frame.
        match member.tx.try_send(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => {
                dropped += 1;
                warn!(%board_id, connection_id = %conn, error = %e, "session: fan-out dropped frame");
            }
        }
    }
    (delivered, dropped)
}

// =============================================================================
// RESULTS
// =============================================================================

/// Outcome of attaching a connection to a session.
#[derive(Debug, Clone)]
pub struct Attached {
    pub board_id: String,
    pub snapshot: Option<Snapshot>,
    /// The session did not exist before this join.
    pub created: bool,
    /// The session was in its grace period and is active again.
    pub resumed: bool,
    pub members: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    NotMember,
    Remaining(usize),
    /// Last member left; the grace timer is running.
    Emptied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Applied { delivered: usize, dropped: usize, created: bool },
    Rejected { role: Option<Role> },
}

/// Point-in-time copy of a session's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub snapshot: Option<Snapshot>,
    pub phase: SessionPhase,
    pub members: usize,
    pub last_mutation_ms: Option<i64>,
}

// =============================================================================
// SESSION TABLE
// =============================================================================

#[derive(Clone)]
pub struct SessionTable {
    inner: Arc<RwLock<HashMap<String, Arc<Mutex<BoardSession>>>>>,
    seq: Arc<AtomicU64>,
    grace: Duration,
}

impl SessionTable {
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())), seq: Arc::new(AtomicU64::new(0)), grace }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Attach a connection, creating the session (seeded with `seed`) if it does not exist.
    ///
    /// `seed` is ignored when the session is already live.
    pub async fn attach(
        &self,
        board_id: &str,
        conn: ConnectionId,
        role: Role,
        tx: mpsc::Sender<Frame>,
        seed: Option<Snapshot>,
    ) -> Attached {
        {
            let sessions = self.inner.read().await;
            if let Some(session) = sessions.get(board_id) {
                return session.lock().await.attach(conn, role, tx, false);
            }
        }

        let mut sessions = self.inner.write().await;
        // EDGE: another join may have created the session while we waited for the write lock.
        if let Some(existing) = sessions.get(board_id).cloned() {
            return existing.lock().await.attach(conn, role, tx, false);
        }

        let mut session = BoardSession::new(board_id, seed, self.next_seq());
        let attached = session.attach(conn, role, tx, true);
        sessions.insert(board_id.to_owned(), Arc::new(Mutex::new(session)));
        info!(%board_id, "session: created");
        attached
    }

    /// Detach a connection. Arms the grace timer if this was the last member.
    pub async fn detach(&self, board_id: &str, conn: ConnectionId) -> Detached {
        let sessions = self.inner.read().await;
        let Some(session) = sessions.get(board_id) else {
            return Detached::NotMember;
        };
        let mut session = session.lock().await;
        if session.members.remove(&conn).is_none() {
            return Detached::NotMember;
        }
        if !session.members.is_empty() {
            return Detached::Remaining(session.members.len());
        }

        self.arm_grace_timer(&mut session);
        Detached::Emptied
    }

    /// Replace a board's snapshot and fan the prepared frame out to every other member.
    ///
    /// An unknown board is created holding the snapshot, with no members, and
    /// enters its grace period immediately.
    pub async fn mutate(
        &self,
        board_id: &str,
        from: ConnectionId,
        snapshot: Snapshot,
        policy: MutationPolicy,
        frame: &Frame,
    ) -> Mutation {
        {
            let sessions = self.inner.read().await;
            if let Some(session) = sessions.get(board_id) {
                return session.lock().await.apply(from, snapshot, policy, frame, self.next_seq());
            }
        }

        if !policy.permits(None) {
            return Mutation::Rejected { role: None };
        }

        let mut sessions = self.inner.write().await;
        if let Some(existing) = sessions.get(board_id).cloned() {
            return existing.lock().await.apply(from, snapshot, policy, frame, self.next_seq());
        }

        let mut session = BoardSession::new(board_id, Some(snapshot), self.next_seq());
        session.last_mutation_ms = Some(now_ms());
        self.arm_grace_timer(&mut session);
        sessions.insert(board_id.to_owned(), Arc::new(Mutex::new(session)));
        info!(%board_id, "session: created by mutation with no members");
        Mutation::Applied { delivered: 0, dropped: 0, created: true }
    }

    /// Find the live session whose id ends with `code`.
    ///
    /// On collision the most recently mutated session wins (creation counts
    /// as a mutation for sessions never written to).
    pub async fn resolve_join_code(&self, code: &str) -> Option<String> {
        let sessions = self.inner.read().await;
        let mut best: Option<(u64, &String)> = None;
        for (board_id, session) in sessions.iter() {
            if !board_id.ends_with(code) {
                continue;
            }
            let seq = session.lock().await.seq;
            if best.is_none_or(|(best_seq, _)| seq > best_seq) {
                best = Some((seq, board_id));
            }
        }
        best.map(|(_, board_id)| board_id.clone())
    }

    /// (Re)arm the session's debounced auto-save. Returns `false` if the board is not live.
    ///
    /// Each call aborts the previously pending timer. When the timer fires,
    /// `save` receives the session's snapshot at that moment; sessions that
    /// still hold the empty default are skipped. The save itself runs on its
    /// own task so a later re-arm never cancels an in-flight write.
    pub async fn debounce_autosave<F, Fut>(&self, board_id: &str, delay: Duration, save: F) -> bool
    where
        F: FnOnce(Snapshot) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let sessions = self.inner.read().await;
        let Some(session) = sessions.get(board_id) else {
            return false;
        };

        let handle = Arc::clone(session);
        let owned_board_id = board_id.to_owned();
        let mut session = session.lock().await;
        if let Some(pending) = session.autosave.take() {
            pending.abort();
        }
        session.autosave = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let snapshot = handle.lock().await.snapshot.clone();
            match snapshot {
                Some(snapshot) => {
                    tokio::spawn(save(snapshot));
                }
                None => debug!(board_id = %owned_board_id, "session: autosave skipped, board is empty"),
            }
        }));
        true
    }

    /// Point-in-time view of one session.
    pub async fn view(&self, board_id: &str) -> Option<SessionView> {
        let sessions = self.inner.read().await;
        let session = sessions.get(board_id)?;
        Some(session.lock().await.view())
    }

    /// Views of every live session, in no particular order.
    pub async fn views(&self) -> Vec<SessionView> {
        let sessions = self.inner.read().await;
        let mut views = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            views.push(session.lock().await.view());
        }
        views
    }

    #[cfg(test)]
    pub async fn phase(&self, board_id: &str) -> Option<SessionPhase> {
        self.view(board_id).await.map(|v| v.phase)
    }

    pub async fn contains(&self, board_id: &str) -> bool {
        self.inner.read().await.contains_key(board_id)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    fn arm_grace_timer(&self, session: &mut BoardSession) {
        session.epoch += 1;
        if let Some(previous) = session.grace_timer.take() {
            previous.abort();
        }

        let table = self.clone();
        let board_id = session.board_id.clone();
        let epoch = session.epoch;
        let grace = self.grace;
        session.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            table.evict_if_idle(&board_id, epoch).await;
        }));
        info!(board_id = %session.board_id, grace_ms = grace.as_millis(), "session: grace period started");
    }

    /// Evict a session if it is still empty and no transition happened since `epoch`.
    async fn evict_if_idle(&self, board_id: &str, epoch: u64) -> bool {
        let mut sessions = self.inner.write().await;
        let Some(session) = sessions.get(board_id).cloned() else {
            return false;
        };
        let lived_ms = {
            let session = session.lock().await;
            if !session.members.is_empty() || session.epoch != epoch {
                return false;
            }
            now_ms() - session.created_at_ms
        };
        // A pending autosave is left to fire: it holds its own handle and persists the final snapshot.
        sessions.remove(board_id);
        info!(%board_id, lived_ms, "session: evicted after grace period");
        true
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
