//! Upload/operation attempts and their lifecycle.

use crate::models::hash::{HashAlgorithm, StorageHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// What kind of attempt a request records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RequestOperation {
    PostUpload,
    ChunkedUpload,
    Pin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Duplicate,
}

impl RequestStatus {
    /// Terminal statuses are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Duplicate
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Duplicate => "duplicate",
        };
        f.write_str(s)
    }
}

/// One upload/operation attempt.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Request {
    /// Autoincrement id.
    pub id: i64,

    pub operation: RequestOperation,

    /// Name of the storage protocol that owns the content.
    pub protocol: String,

    pub status: RequestStatus,

    /// Claimed hash until `verified_at` is set, recomputed hash afterwards.
    pub hash_algorithm: Option<HashAlgorithm>,
    pub hash_digest: Option<Vec<u8>>,
    pub hash_proof: Option<Vec<u8>>,

    /// Declared size in bytes.
    pub size: i64,

    pub mime_type: Option<String>,
    pub source_ip: Option<String>,
    pub user_id: Option<String>,

    /// Set once the verify stage recomputed the hash from stored bytes.
    pub verified_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Last activity, refreshed by progress events.
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn hash(&self) -> Option<StorageHash> {
        match (self.hash_algorithm, &self.hash_digest) {
            (Some(algorithm), Some(digest)) if !digest.is_empty() => Some(
                StorageHash::new(algorithm, digest.clone()).with_proof(self.hash_proof.clone()),
            ),
            _ => None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }
}

/// Fields supplied when a request is first recorded.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub protocol: String,
    pub hash: Option<StorageHash>,
    pub size: u64,
    pub mime_type: Option<String>,
    pub source_ip: Option<String>,
    pub user_id: Option<String>,
}
