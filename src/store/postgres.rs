//! `PostgreSQL` snapshot store.
//!
//! One row per board in `whiteboards`. Saves are upserts; a save without a
//! preview image keeps the stored preview (auto-save never renders one).

use sqlx::{PgPool, Row};

use super::{SnapshotStore, StoreError, StoredSnapshot};
use crate::services::session::Snapshot;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for PgStore {
    async fn load(&self, board_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let row = sqlx::query(
            "SELECT data, data_is_json, preview_image, (EXTRACT(EPOCH FROM updated_at) * 1000)::BIGINT AS updated_at_ms \
             FROM whiteboards WHERE board_id = $1",
        )
        .bind(board_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredSnapshot {
            snapshot: if r.get::<bool, _>("data_is_json") {
                Snapshot::from_json_text(r.get::<String, _>("data"))
            } else {
                Snapshot::from(r.get::<String, _>("data"))
            },
            preview_image: r.get("preview_image"),
            updated_at_ms: r.get("updated_at_ms"),
        }))
    }

    async fn save(&self, board_id: &str, snapshot: &Snapshot, preview_image: Option<&str>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO whiteboards (board_id, data, data_is_json, preview_image, updated_at) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (board_id) DO UPDATE SET \
                 data = EXCLUDED.data, \
                 data_is_json = EXCLUDED.data_is_json, \
                 preview_image = COALESCE(EXCLUDED.preview_image, whiteboards.preview_image), \
                 updated_at = now()",
        )
        .bind(board_id)
        .bind(snapshot.as_str())
        .bind(snapshot.is_structured())
        .bind(preview_image)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
