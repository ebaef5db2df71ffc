//! In-progress multipart uploads that survive restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A multipart upload started against a backend and not yet completed.
/// At most one exists per `(bucket, key)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PartialMultipartUpload {
    /// Internal id for DB indexing.
    pub id: i64,

    /// Destination bucket.
    pub bucket: String,

    /// Destination object key.
    pub key: String,

    /// Backend-issued upload id.
    pub upload_id: String,

    /// Timestamp when upload was initiated.
    pub created_at: DateTime<Utc>,
}
