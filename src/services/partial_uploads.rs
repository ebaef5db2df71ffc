//! Bookkeeping for multipart uploads that must survive a crash.

use crate::models::multipart::PartialMultipartUpload;
use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct PartialUploads {
    db: SqlitePool,
}

impl PartialUploads {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<PartialMultipartUpload>, sqlx::Error> {
        sqlx::query_as::<_, PartialMultipartUpload>(
            "SELECT id, bucket, key, upload_id, created_at
             FROM partial_multipart_uploads WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.db)
        .await
    }

    /// Record `upload_id` as the in-progress upload for `(bucket, key)`,
    /// replacing any previous record.
    pub async fn save(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<PartialMultipartUpload, sqlx::Error> {
        sqlx::query_as::<_, PartialMultipartUpload>(
            r#"
            INSERT INTO partial_multipart_uploads (bucket, key, upload_id, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                upload_id = excluded.upload_id,
                created_at = excluded.created_at
            RETURNING id, bucket, key, upload_id, created_at
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(upload_id)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM partial_multipart_uploads WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
