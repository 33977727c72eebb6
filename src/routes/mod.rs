//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router carries the WebSocket relay endpoint, the join-code
//! lookup used by share links, and the health and stats probes. Identity is
//! established upstream; the relay only reads what the authenticator passed
//! through.

pub mod boards;
pub mod ws;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::services::session::SessionPhase;
use crate::state::AppState;

/// Build the relay router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/boards/resolve/{code}", get(boards::resolve_join_code))
        .route("/api/stats", get(stats))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub connections: usize,
    pub sessions: usize,
    pub sessions_in_grace: usize,
    pub attached_members: usize,
    pub voice_rooms: usize,
    pub last_mutation_ms: Option<i64>,
}

/// Live table sizes. Counts only; no board ids or identities leak here.
async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let views = state.sessions.views().await;
    Json(StatsResponse {
        connections: state.registry.len().await,
        sessions: views.len(),
        sessions_in_grace: views.iter().filter(|v| v.phase == SessionPhase::GracePeriod).count(),
        attached_members: views.iter().map(|v| v.members).sum(),
        voice_rooms: state.voice.room_count().await,
        last_mutation_ms: views.iter().filter_map(|v| v.last_mutation_ms).max(),
    })
}
