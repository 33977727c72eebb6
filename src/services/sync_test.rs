use super::*;
use crate::config::RelayConfig;
use crate::services::session::{MutationPolicy, SessionPhase};
use crate::state::test_helpers::{test_app_state, test_app_state_with, test_config};
use crate::store::SnapshotStore;
use tokio::time::{sleep, timeout};

struct Client {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

async fn connect(state: &AppState, identity: &str) -> Client {
    let (tx, rx) = mpsc::channel(32);
    let id = state.registry.admit(identity, tx.clone()).await;
    Client { id, tx, rx }
}

async fn join(state: &AppState, client: &Client, board_id: &str, role: Role, seed: Option<&str>) -> Result<Joined, SyncError> {
    join_board(state, client.id, client.tx.clone(), board_id, role, seed.map(Snapshot::from)).await
}

async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(300), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("channel closed")
}

async fn assert_no_broadcast(rx: &mut mpsc::Receiver<Frame>) {
    let got = timeout(Duration::from_millis(80), rx.recv()).await;
    assert!(got.is_err(), "expected no broadcast, got {got:?}");
}

// =============================================================================
// VALIDATION
// =============================================================================

#[test]
fn board_id_validation() {
    assert!(valid_board_id("abc123def456"));
    assert!(valid_board_id("ünïcødé-board"));
    assert!(!valid_board_id(""));
    assert!(!valid_board_id("bad\nid"));
    assert!(!valid_board_id(&"x".repeat(MAX_BOARD_ID_LEN + 1)));
    assert!(valid_board_id(&"x".repeat(MAX_BOARD_ID_LEN)));
}

#[test]
fn join_code_is_last_six_characters() {
    assert_eq!(join_code_of("abc123def456"), "def456");
    assert_eq!(join_code_of("short"), "short");
    assert_eq!(join_code_of("board-ééééééé"), "éééééé");
    assert!(is_join_code("def456"));
    assert!(is_join_code("éééééé"));
    assert!(!is_join_code("def45"));
}

#[test]
fn error_codes() {
    let err = SyncError::JoinCodeNotFound { code: "zzz999".into() };
    assert_eq!(err.error_code(), "E_JOIN_CODE_NOT_FOUND");
    assert!(!err.retryable());

    let err = SyncError::from(StoreError::Status { status: 503 });
    assert_eq!(err.error_code(), "E_PERSISTENCE_STATUS");
    assert!(err.retryable());
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn viewer_receives_host_seed() {
    let state = test_app_state();
    let host = connect(&state, "host").await;
    let viewer = connect(&state, "viewer").await;

    let joined = join(&state, &host, "B", Role::Host, Some("S")).await.unwrap();
    assert!(joined.created);
    assert_eq!(joined.snapshot, Some(Snapshot::from("S")));

    let joined = join(&state, &viewer, "B", Role::Viewer, None).await.unwrap();
    assert_eq!(joined.board_id, "B");
    assert_eq!(joined.snapshot, Some(Snapshot::from("S")));
}

#[tokio::test]
async fn viewer_seed_is_ignored() {
    let state = test_app_state();
    let viewer = connect(&state, "viewer").await;

    let joined = join(&state, &viewer, "a-long-board-id", Role::Viewer, Some("viewer-seed")).await.unwrap();
    assert!(joined.created);
    assert_eq!(joined.snapshot, None);
}

#[tokio::test]
async fn viewer_joins_by_code() {
    let state = test_app_state();
    let host = connect(&state, "host").await;
    let viewer = connect(&state, "viewer").await;
    join(&state, &host, "abc123def456", Role::Host, Some("rect")).await.unwrap();

    let joined = join(&state, &viewer, "def456", Role::Viewer, None).await.unwrap();
    assert_eq!(joined.board_id, "abc123def456");
    assert_eq!(joined.snapshot, Some(Snapshot::from("rect")));
    assert!(state.registry.info(viewer.id).await.unwrap().boards.contains(&"abc123def456".to_string()));
    assert!(!state.sessions.contains("def456").await);
}

#[tokio::test]
async fn unknown_join_code_is_an_error() {
    let state = test_app_state();
    let viewer = connect(&state, "viewer").await;

    let err = join(&state, &viewer, "zzz999", Role::Viewer, None).await.unwrap_err();
    assert!(matches!(err, SyncError::JoinCodeNotFound { ref code } if code == "zzz999"));
    assert_eq!(state.sessions.len().await, 0);
}

#[tokio::test]
async fn host_with_six_char_id_uses_exact_id() {
    let state = test_app_state();
    let other = connect(&state, "other").await;
    let host = connect(&state, "host").await;
    join(&state, &other, "abc123def456", Role::Host, Some("x")).await.unwrap();

    let joined = join(&state, &host, "def456", Role::Host, None).await.unwrap();
    assert_eq!(joined.board_id, "def456");
    assert!(joined.created);
}

#[tokio::test]
async fn viewer_with_exact_six_char_board_skips_code_lookup() {
    let state = test_app_state();
    let host = connect(&state, "host").await;
    let viewer = connect(&state, "viewer").await;
    join(&state, &host, "zzzdef456", Role::Host, Some("wrong")).await.unwrap();
    join(&state, &host, "def456", Role::Host, Some("right")).await.unwrap();

    let joined = join(&state, &viewer, "def456", Role::Viewer, None).await.unwrap();
    assert_eq!(joined.board_id, "def456");
    assert_eq!(joined.snapshot, Some(Snapshot::from("right")));
}

#[tokio::test]
async fn hydrate_on_join_seeds_new_session_from_store() {
    let (state, store) = test_app_state_with(RelayConfig { hydrate_on_join: true, ..test_config() });
    store.seed("B", Snapshot::from("persisted")).await;
    let viewer = connect(&state, "viewer").await;

    let joined = join(&state, &viewer, "B", Role::Viewer, None).await.unwrap();
    assert_eq!(joined.snapshot, Some(Snapshot::from("persisted")));
}

#[tokio::test]
async fn hydration_disabled_by_default() {
    let (state, store) = test_app_state_with(test_config());
    store.seed("B", Snapshot::from("persisted")).await;
    let viewer = connect(&state, "viewer").await;

    let joined = join(&state, &viewer, "B", Role::Viewer, None).await.unwrap();
    assert_eq!(joined.snapshot, None);
}

#[tokio::test]
async fn host_seed_wins_over_hydration() {
    let (state, store) = test_app_state_with(RelayConfig { hydrate_on_join: true, ..test_config() });
    store.seed("B", Snapshot::from("persisted")).await;
    let host = connect(&state, "host").await;

    let joined = join(&state, &host, "B", Role::Host, Some("fresh")).await.unwrap();
    assert_eq!(joined.snapshot, Some(Snapshot::from("fresh")));
}

// =============================================================================
// MUTATE
// =============================================================================

#[tokio::test]
async fn mutations_relayed_in_order_without_echo() {
    let state = test_app_state();
    let mut host = connect(&state, "alice").await;
    let mut viewer = connect(&state, "bob").await;
    join(&state, &host, "B", Role::Host, None).await.unwrap();
    join(&state, &viewer, "B", Role::Viewer, None).await.unwrap();

    for n in 1..=5 {
        mutate_board(&state, host.id, "alice", "B", Snapshot::from(format!("S{n}"))).await.unwrap();
    }

    for n in 1..=5 {
        let frame = recv(&mut viewer.rx).await;
        assert_eq!(frame.syscall, "board:data");
        assert_eq!(frame.from.as_deref(), Some("alice"));
        assert_eq!(frame.board_id(), Some("B"));
        assert_eq!(frame.str_field(FRAME_SNAPSHOT), Some(format!("S{n}").as_str()));
    }
    assert_no_broadcast(&mut host.rx).await;
    assert_eq!(state.sessions.view("B").await.unwrap().snapshot, Some(Snapshot::from("S5")));
}

#[tokio::test]
async fn host_only_policy_refuses_viewer() {
    let (state, _store) = test_app_state_with(RelayConfig { mutation_policy: MutationPolicy::HostOnly, ..test_config() });
    let mut host = connect(&state, "host").await;
    let viewer = connect(&state, "viewer").await;
    join(&state, &host, "B", Role::Host, Some("v0")).await.unwrap();
    join(&state, &viewer, "B", Role::Viewer, None).await.unwrap();

    let err = mutate_board(&state, viewer.id, "viewer", "B", Snapshot::from("evil")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_MUTATION_FORBIDDEN");
    assert_no_broadcast(&mut host.rx).await;
    assert_eq!(state.sessions.view("B").await.unwrap().snapshot, Some(Snapshot::from("v0")));
}

#[tokio::test]
async fn join_code_scenario_viewer_mutation_reaches_host() {
    let state = test_app_state();
    let mut host = connect(&state, "host").await;
    let mut viewer = connect(&state, "viewer").await;

    join(&state, &host, "abc123def456", Role::Host, Some("rect")).await.unwrap();
    let joined = join(&state, &viewer, "def456", Role::Viewer, None).await.unwrap();
    assert_eq!(joined.snapshot, Some(Snapshot::from("rect")));

    mutate_board(&state, host.id, "host", "abc123def456", Snapshot::from("circle")).await.unwrap();
    assert_eq!(recv(&mut viewer.rx).await.str_field(FRAME_SNAPSHOT), Some("circle"));

    mutate_board(&state, viewer.id, "viewer", "abc123def456", Snapshot::from("triangle")).await.unwrap();
    let relayed = recv(&mut host.rx).await;
    assert_eq!(relayed.str_field(FRAME_SNAPSHOT), Some("triangle"));
    assert_eq!(relayed.from.as_deref(), Some("viewer"));
}

// =============================================================================
// LEAVE / DISCONNECT
// =============================================================================

#[tokio::test]
async fn leave_starts_grace_and_rejoin_restores() {
    let state = test_app_state();
    let host = connect(&state, "host").await;
    join(&state, &host, "B", Role::Host, Some("S")).await.unwrap();

    assert!(leave_board(&state, host.id, "B").await);
    assert!(!leave_board(&state, host.id, "B").await);
    assert_eq!(state.sessions.phase("B").await, Some(SessionPhase::GracePeriod));
    assert!(state.registry.info(host.id).await.unwrap().boards.is_empty());

    let joined = join(&state, &host, "B", Role::Host, None).await.unwrap();
    assert!(joined.resumed);
    assert_eq!(joined.snapshot, Some(Snapshot::from("S")));
}

#[tokio::test]
async fn disconnect_of_sole_member_then_grace_expiry_recreates() {
    let state = test_app_state();
    let host = connect(&state, "host").await;
    join(&state, &host, "B", Role::Host, Some("S")).await.unwrap();

    disconnect(&state, host.id).await;
    assert_eq!(state.sessions.phase("B").await, Some(SessionPhase::GracePeriod));

    sleep(state.config.grace_period + Duration::from_millis(100)).await;
    assert!(!state.sessions.contains("B").await);

    let again = connect(&state, "host").await;
    let joined = join(&state, &again, "B", Role::Host, None).await.unwrap();
    assert!(joined.created);
    assert_eq!(joined.snapshot, None);
}

#[tokio::test]
async fn disconnect_is_idempotent_and_clears_voice() {
    let state = test_app_state();
    let mut watcher = connect(&state, "watcher").await;
    let client = connect(&state, "client").await;
    join(&state, &client, "B1", Role::Host, None).await.unwrap();
    join(&state, &client, "B2", Role::Viewer, None).await.unwrap();
    state.voice.join("B1", "w", watcher.id, watcher.tx.clone()).await;
    state.voice.join("B1", "c", client.id, client.tx.clone()).await;
    assert_eq!(recv(&mut watcher.rx).await.syscall, "voice:joined");

    disconnect(&state, client.id).await;
    disconnect(&state, client.id).await;

    let left = recv(&mut watcher.rx).await;
    assert_eq!(left.syscall, "voice:left");
    assert_eq!(left.str_field("peer_id"), Some("c"));
    assert_no_broadcast(&mut watcher.rx).await;
    assert_eq!(state.voice.peers("B1").await, vec!["w"]);
    assert_eq!(state.sessions.phase("B1").await, Some(SessionPhase::GracePeriod));
    assert_eq!(state.sessions.phase("B2").await, Some(SessionPhase::GracePeriod));
    assert_eq!(state.registry.len().await, 1);
}

// =============================================================================
// RESOLVE
// =============================================================================

#[tokio::test]
async fn resolve_hits_suffix_and_rejects_unknown() {
    let state = test_app_state();
    let host = connect(&state, "host").await;
    join(&state, &host, "abc123def456", Role::Host, None).await.unwrap();

    assert_eq!(resolve_join_code(&state, "def456").await.unwrap(), "abc123def456");
    assert!(matches!(resolve_join_code(&state, "zzz999").await, Err(SyncError::JoinCodeNotFound { .. })));
    assert!(matches!(resolve_join_code(&state, "f456").await, Err(SyncError::JoinCodeNotFound { .. })));
}

// =============================================================================
// SAVE / AUTOSAVE
// =============================================================================

#[tokio::test]
async fn save_uses_live_snapshot_when_none_supplied() {
    let (state, store) = test_app_state_with(test_config());
    let host = connect(&state, "host").await;
    join(&state, &host, "B", Role::Host, Some("live")).await.unwrap();

    save_board(&state, "B", None, Some("preview")).await.unwrap();
    let stored = store.load("B").await.unwrap().expect("saved");
    assert_eq!(stored.snapshot, Snapshot::from("live"));
    assert_eq!(stored.preview_image.as_deref(), Some("preview"));

    save_board(&state, "B", Some(Snapshot::from("explicit")), None).await.unwrap();
    let stored = store.load("B").await.unwrap().expect("saved");
    assert_eq!(stored.snapshot, Snapshot::from("explicit"));
    assert_eq!(stored.preview_image.as_deref(), Some("preview"));
}

#[tokio::test]
async fn save_with_nothing_to_save_fails() {
    let state = test_app_state();
    let err = save_board(&state, "ghost", None, None).await.unwrap_err();
    assert_eq!(err.error_code(), "E_NOTHING_TO_SAVE");
}

#[tokio::test]
async fn save_failure_surfaces_and_keeps_live_snapshot() {
    let (state, store) = test_app_state_with(test_config());
    let host = connect(&state, "host").await;
    join(&state, &host, "B", Role::Host, Some("live")).await.unwrap();
    store.set_fail_saves(true);

    let err = save_board(&state, "B", None, None).await.unwrap_err();
    assert_eq!(err.error_code(), "E_PERSISTENCE_STATUS");
    assert!(err.retryable());
    assert_eq!(state.sessions.view("B").await.unwrap().snapshot, Some(Snapshot::from("live")));
}

#[tokio::test]
async fn autosave_requests_coalesce() {
    let (state, store) = test_app_state_with(test_config());
    let host = connect(&state, "host").await;
    join(&state, &host, "B", Role::Host, None).await.unwrap();
    let request = Frame::request("board:autosave", Data::new());

    for n in 1..=3 {
        mutate_board(&state, host.id, "host", "B", Snapshot::from(format!("S{n}"))).await.unwrap();
        let delay = request_autosave(&state, host.id, &request, "B").await.unwrap();
        assert_eq!(delay, state.config.autosave_debounce);
        sleep(Duration::from_millis(10)).await;
    }

    sleep(state.config.autosave_debounce + Duration::from_millis(150)).await;
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.load("B").await.unwrap().unwrap().snapshot, Snapshot::from("S3"));
}

#[tokio::test]
async fn autosave_failure_reported_to_requester() {
    let (state, store) = test_app_state_with(test_config());
    let mut host = connect(&state, "host").await;
    join(&state, &host, "B", Role::Host, Some("S")).await.unwrap();
    store.set_fail_saves(true);
    let request = Frame::request("board:autosave", Data::new()).with_board_id("B");

    request_autosave(&state, host.id, &request, "B").await.unwrap();

    let frame = recv(&mut host.rx).await;
    assert_eq!(frame.parent_id, Some(request.id));
    assert_eq!(frame.status, crate::frame::Status::Error);
    assert_eq!(frame.str_field("code"), Some("E_PERSISTENCE_STATUS"));
}

#[tokio::test]
async fn autosave_on_board_not_live_fails() {
    let state = test_app_state();
    let host = connect(&state, "host").await;
    let request = Frame::request("board:autosave", Data::new());

    let err = request_autosave(&state, host.id, &request, "ghost").await.unwrap_err();
    assert_eq!(err.error_code(), "E_BOARD_NOT_LIVE");
}
