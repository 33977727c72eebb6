//! Board lookup routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;

use crate::services::sync::{self, SyncError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub board_id: String,
}

fn sync_error_to_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::JoinCodeNotFound { .. } | SyncError::BoardNotLive { .. } | SyncError::NothingToSave { .. } => {
            StatusCode::NOT_FOUND
        }
        SyncError::MutationForbidden { .. } => StatusCode::FORBIDDEN,
        SyncError::Persistence(_) => StatusCode::BAD_GATEWAY,
    }
}

/// `GET /api/boards/resolve/{code}` — full board id for a viewer's join code.
pub async fn resolve_join_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<ResolveResponse>, StatusCode> {
    let board_id = sync::resolve_join_code(&state, &code)
        .await
        .map_err(|e| sync_error_to_status(&e))?;
    Ok(Json(ResolveResponse { board_id }))
}

#[cfg(test)]
#[path = "boards_test.rs"]
mod tests;
