//! Durable upload metadata and pins.

use crate::models::{
    hash::StorageHash,
    upload::{NewUpload, Pin, Upload},
};
use chrono::Utc;
use sqlx::SqlitePool;

const UPLOAD_COLUMNS: &str = "id, hash_algorithm, hash_digest, protocol, object_name, mime_type, \
     size, user_id, uploader_ip, created_at";

#[derive(Clone)]
pub struct UploadService {
    db: SqlitePool,
}

impl UploadService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get_upload(&self, hash: &StorageHash) -> Result<Option<Upload>, sqlx::Error> {
        sqlx::query_as::<_, Upload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE hash_algorithm = ? AND hash_digest = ?"
        ))
        .bind(hash.algorithm)
        .bind(&hash.digest)
        .fetch_optional(&self.db)
        .await
    }

    /// Insert the upload, or return the existing row for the same hash.
    /// The first uploader stays on record.
    pub async fn save_upload(&self, new: NewUpload) -> Result<Upload, sqlx::Error> {
        sqlx::query_as::<_, Upload>(&format!(
            "INSERT INTO uploads (
                hash_algorithm, hash_digest, protocol, object_name, mime_type,
                size, user_id, uploader_ip, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(hash_algorithm, hash_digest) DO UPDATE SET
                mime_type = COALESCE(uploads.mime_type, excluded.mime_type)
             RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(new.hash.algorithm)
        .bind(&new.hash.digest)
        .bind(&new.protocol)
        .bind(&new.object_name)
        .bind(&new.mime_type)
        .bind(new.size as i64)
        .bind(&new.user_id)
        .bind(&new.uploader_ip)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await
    }

    /// Pin `upload_id` for `user_id`. Returns `false` when already pinned.
    pub async fn pin(&self, upload_id: i64, user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO pins (upload_id, user_id, created_at) VALUES (?, ?, ?)
             ON CONFLICT(upload_id, user_id) DO NOTHING",
        )
        .bind(upload_id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn pins(&self, upload_id: i64) -> Result<Vec<Pin>, sqlx::Error> {
        sqlx::query_as::<_, Pin>(
            "SELECT id, upload_id, user_id, created_at FROM pins WHERE upload_id = ? ORDER BY id",
        )
        .bind(upload_id)
        .fetch_all(&self.db)
        .await
    }

    /// Whether `user_id` holds a pin on the upload with this hash.
    pub async fn pinned_by_user(
        &self,
        hash: &StorageHash,
        user_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT p.id FROM pins p JOIN uploads u ON u.id = p.upload_id
             WHERE u.hash_algorithm = ? AND u.hash_digest = ? AND p.user_id = ?",
        )
        .bind(hash.algorithm)
        .bind(&hash.digest)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.is_some())
    }
}
