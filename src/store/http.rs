//! Remote document API snapshot store.
//!
//! Thin HTTP wrapper over the editor's existing whiteboard API:
//! `POST {base}/api/whiteboards/save` and `GET {base}/api/whiteboards/{id}`.
//! Pure parsing in `parse_load_body` for testability.

use std::time::Duration;

use reqwest::Url;
use serde::Serialize;

use super::{SnapshotStore, StoreError, StoredSnapshot};
use crate::services::session::Snapshot;

const CONNECT_TIMEOUT_SECS: u64 = 5;

pub struct HttpStore {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpStore {
    /// Build a store client against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute http(s) URL or the
    /// HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url).map_err(|e| StoreError::InvalidBaseUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::InvalidBaseUrl(format!("{base_url} cannot carry a path")));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http, base_url })
    }

    /// `base_url` with `segments` appended, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveRequest<'a> {
    board_id: &'a str,
    data: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_image: Option<&'a str>,
}

#[async_trait::async_trait]
impl SnapshotStore for HttpStore {
    async fn load(&self, board_id: &str) -> Result<Option<StoredSnapshot>, StoreError> {
        let response = self.http.get(self.endpoint(&["api", "whiteboards", board_id])).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StoreError::Status { status: status.as_u16() });
        }

        let body = response.text().await?;
        parse_load_body(&body)
    }

    async fn save(&self, board_id: &str, snapshot: &Snapshot, preview_image: Option<&str>) -> Result<(), StoreError> {
        let body = SaveRequest { board_id, data: snapshot.as_str(), preview_image };
        let response = self
            .http
            .post(self.endpoint(&["api", "whiteboards", "save"]))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status { status: status.as_u16() });
        }
        Ok(())
    }
}

/// Parse a `GET /api/whiteboards/{id}` body: `{"data": <string|json>, "previewImage"?: string}`.
///
/// A missing or null `data` field means the board exists but has never
/// been drawn on, which the relay treats the same as not found.
pub(crate) fn parse_load_body(body: &str) -> Result<Option<StoredSnapshot>, StoreError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(StoreError::Decode("expected a JSON object".into()));
    };

    let snapshot = match object.get("data") {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(data) => Snapshot::from_json(data),
    };
    let preview_image = object
        .get("previewImage")
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    Ok(Some(StoredSnapshot { snapshot, preview_image, updated_at_ms: None }))
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
