//! In-memory snapshot store.
//!
//! Default backend for local runs and the store used by the test suite.
//! `fail_saves` flips the store into a failing mode so error paths can be
//! exercised without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::RwLock;

use super::{SnapshotStore, StoreError, StoredSnapshot};
use crate::frame::now_ms;
use crate::services::session::Snapshot;

#[derive(Default)]
pub struct MemoryStore {
    boards: RwLock<HashMap<String, StoredSnapshot>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves since construction.
    #[cfg(test)]
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every subsequent save fail with a 503 status error.
    #[cfg(test)]
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Insert a stored snapshot directly, bypassing the save path.
    #[cfg(test)]
    pub async fn seed(&self, board_id: &str, snapshot: Snapshot) {
        let stored = StoredSnapshot { snapshot, preview_image: None, updated_at_ms: Some(now_ms()) };
        self.boards.write().await.insert(board_id.to_owned(), stored);
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, board_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        Ok(self.boards.read().await.get(board_id).cloned())
    }

    async fn save(&self, board_id: &str, snapshot: &Snapshot, preview_image: Option<&str>) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Status { status: 503 });
        }

        let mut boards = self.boards.write().await;
        let previous_preview = boards
            .get(board_id)
            .and_then(|stored| stored.preview_image.clone());
        boards.insert(
            board_id.to_owned(),
            StoredSnapshot {
                snapshot: snapshot.clone(),
                preview_image: preview_image.map(str::to_owned).or(previous_preview),
                updated_at_ms: Some(now_ms()),
            },
        );
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
