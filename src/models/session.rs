//! Chunked-upload session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// Side-car stored next to the buffered bytes as `<id>.info`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionInfo {
    /// Session id, also the buffer object key.
    pub id: String,

    /// Declared total size.
    pub size: u64,

    /// Bytes durably received so far.
    pub offset: u64,

    /// Decoded `Upload-Metadata` pairs.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Buffer multipart upload id while bytes are still arriving.
    #[serde(default)]
    pub multipart_id: Option<String>,

    /// Part size the buffer upload was started with.
    pub part_size: u64,

    #[serde(default)]
    pub completed: bool,

    pub created_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Mime type from the first metadata key clients are known to use.
    pub fn mime_type(&self) -> Option<String> {
        ["mimeType", "mimetype", "filetype"]
            .iter()
            .find_map(|key| self.metadata.get(*key))
            .filter(|v| !v.is_empty())
            .cloned()
    }

    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }
}

/// Chunked-upload extension of a [`crate::models::request::Request`].
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ChunkedUploadData {
    pub request_id: i64,
    pub session_id: String,
    pub completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(metadata: &[(&str, &str)]) -> SessionInfo {
        SessionInfo {
            id: "abc".into(),
            size: 10,
            offset: 4,
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            multipart_id: None,
            part_size: 5,
            completed: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn mime_type_prefers_known_keys_in_order() {
        assert_eq!(
            info_with(&[("filetype", "text/plain"), ("mimeType", "image/png")]).mime_type(),
            Some("image/png".to_string())
        );
        assert_eq!(
            info_with(&[("filetype", "text/plain")]).mime_type(),
            Some("text/plain".to_string())
        );
        assert_eq!(info_with(&[("mimetype", "")]).mime_type(), None);
        assert_eq!(info_with(&[]).remaining(), 6);
    }
}
