//! Final metadata of durably stored objects and user pins.

use crate::models::hash::{HashAlgorithm, StorageHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A verified object living in the durable store.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Upload {
    pub id: i64,
    pub hash_algorithm: HashAlgorithm,
    pub hash_digest: Vec<u8>,

    /// Protocol that encoded the object name.
    pub protocol: String,

    /// Key of the object inside the protocol's bucket.
    pub object_name: String,

    pub mime_type: Option<String>,
    pub size: i64,

    /// First uploader.
    pub user_id: Option<String>,
    pub uploader_ip: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Upload {
    pub fn hash(&self) -> StorageHash {
        StorageHash::new(self.hash_algorithm, self.hash_digest.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub hash: StorageHash,
    pub protocol: String,
    pub object_name: String,
    pub mime_type: Option<String>,
    pub size: u64,
    pub user_id: Option<String>,
    pub uploader_ip: Option<String>,
}

/// Marks an upload as retained on behalf of a user.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Pin {
    pub id: i64,
    pub upload_id: i64,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}
