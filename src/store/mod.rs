//! Persistence Bridge — durable load/save of board snapshots.
//!
//! DESIGN
//! ======
//! The relay never owns durability. It calls `SnapshotStore` on explicit
//! `board:save`, when a client-requested auto-save fires, and (optionally)
//! to hydrate a brand-new session on join. Three adapters ship:
//!
//! - `memory`: process-local map, the default and the test double.
//! - `postgres`: upsert into a `whiteboards` table via sqlx.
//! - `http`: the external document API the editor already talks to.
//!
//! ERROR HANDLING
//! ==============
//! Store failures surface as `StoreError` to whoever asked for the save.
//! They never touch in-memory session state.

pub mod http;
pub mod memory;
pub mod postgres;

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::services::session::Snapshot;

// =============================================================================
// TYPES
// =============================================================================

/// A snapshot as last persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub snapshot: Snapshot,
    pub preview_image: Option<String>,
    /// Milliseconds since Unix epoch of the last write, when the backend reports it.
    pub updated_at_ms: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("document store responded with status {status}")]
    Status { status: u16 },
    #[error("document store response malformed: {0}")]
    Decode(String),
    #[error("invalid document store base url: {0}")]
    InvalidBaseUrl(String),
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_PERSISTENCE_DATABASE",
            Self::Http(_) => "E_PERSISTENCE_HTTP",
            Self::Status { .. } => "E_PERSISTENCE_STATUS",
            Self::Decode(_) => "E_PERSISTENCE_DECODE",
            Self::InvalidBaseUrl(_) => "E_PERSISTENCE_CONFIG",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Http(_) | Self::Status { status: 429 | 500..=599 })
    }
}

/// Durable snapshot storage consumed by the synchronization handler.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last saved snapshot for a board, `None` if never saved.
    async fn load(&self, board_id: &str) -> Result<Option<StoredSnapshot>, StoreError>;

    /// Persist a snapshot. A `None` preview keeps whatever preview was stored before.
    async fn save(&self, board_id: &str, snapshot: &Snapshot, preview_image: Option<&str>) -> Result<(), StoreError>;
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

/// Build the configured store adapter.
///
/// # Errors
///
/// Returns an error if the database cannot be reached, migrations fail, or
/// the HTTP client cannot be built.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn SnapshotStore>, StoreError> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(memory::MemoryStore::new())),
        StoreConfig::Postgres { database_url, max_connections } => {
            let pool = crate::db::init_pool(database_url, *max_connections).await?;
            Ok(Arc::new(postgres::PgStore::new(pool)))
        }
        StoreConfig::Http { base_url, timeout_secs } => {
            Ok(Arc::new(http::HttpStore::new(base_url, *timeout_secs)?))
        }
    }
}
