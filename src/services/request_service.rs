//! Request records and their per-operation extension data.
//!
//! A [`Request`] never embeds operation-specific fields. Each operation has a
//! [`DataHandler`] that owns its extension table, keyed by request id, and is
//! bound to its [`RequestOperation`] at compile time.

use crate::models::{
    hash::StorageHash,
    request::{NewRequest, Request, RequestOperation, RequestStatus},
    session::ChunkedUploadData,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request {0} not found")]
    NotFound(i64),
    #[error("request {0} has not been verified")]
    NotVerified(i64),
    #[error("request {id} already finished as {status}")]
    AlreadyFinished { id: i64, status: RequestStatus },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

const REQUEST_COLUMNS: &str = "id, operation, protocol, status, hash_algorithm, hash_digest, \
     hash_proof, size, mime_type, source_ip, user_id, verified_at, created_at, updated_at";

/// Storage of one operation's extension record.
#[async_trait]
pub trait DataHandler: Send + Sync {
    type Data: Send + Sync;
    type Query: Send + Sync;

    const OPERATION: RequestOperation;

    /// Insert inside the transaction that creates the request.
    async fn create(
        &self,
        conn: &mut SqliteConnection,
        request_id: i64,
        data: &Self::Data,
    ) -> Result<(), RequestError>;

    async fn get(&self, request_id: i64) -> Result<Option<Self::Data>, RequestError>;

    async fn update(&self, request_id: i64, data: &Self::Data) -> Result<(), RequestError>;

    async fn delete(&self, request_id: i64) -> Result<(), RequestError>;

    async fn query(&self, query: &Self::Query) -> Result<Vec<Self::Data>, RequestError>;
}

#[derive(Clone)]
pub struct RequestService {
    db: SqlitePool,
}

impl RequestService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Record a new pending request together with its extension data.
    pub async fn create_request<H: DataHandler>(
        &self,
        new: NewRequest,
        handler: &H,
        data: &H::Data,
    ) -> Result<Request, RequestError> {
        let mut tx = self.db.begin().await?;
        let request = insert_request(&mut tx, H::OPERATION, &new).await?;
        handler.create(&mut tx, request.id, data).await?;
        tx.commit().await?;
        Ok(request)
    }

    /// Record a new pending request for an operation without extension data.
    pub async fn record_request(
        &self,
        operation: RequestOperation,
        new: NewRequest,
    ) -> Result<Request, RequestError> {
        let mut conn = self.db.acquire().await?;
        insert_request(&mut conn, operation, &new).await
    }

    pub async fn get_request(&self, id: i64) -> Result<Option<Request>, RequestError> {
        Ok(sqlx::query_as::<_, Request>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?)
    }

    /// Unfinished requests of `operation` claiming `hash`, newest first.
    pub async fn find_active_by_hash(
        &self,
        operation: RequestOperation,
        hash: &StorageHash,
    ) -> Result<Vec<Request>, RequestError> {
        Ok(sqlx::query_as::<_, Request>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests
             WHERE operation = ? AND hash_algorithm = ? AND hash_digest = ?
               AND status IN ('pending', 'processing')
             ORDER BY id DESC"
        ))
        .bind(operation)
        .bind(hash.algorithm)
        .bind(&hash.digest)
        .fetch_all(&self.db)
        .await?)
    }

    /// Move a request to `status`. Terminal requests are left untouched, and
    /// `Completed`/`Duplicate` must go through [`Self::complete_request`].
    pub async fn update_status(&self, id: i64, status: RequestStatus) -> Result<(), RequestError> {
        if matches!(status, RequestStatus::Completed | RequestStatus::Duplicate) {
            return self.complete_request(id, status).await;
        }
        let result = sqlx::query(
            "UPDATE requests SET status = ?, updated_at = ?
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'duplicate')",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 && self.get_request(id).await?.is_none() {
            return Err(RequestError::NotFound(id));
        }
        Ok(())
    }

    /// Replace the hash with the recomputed one and mark it verified.
    pub async fn mark_verified(&self, id: i64, hash: &StorageHash) -> Result<(), RequestError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE requests
             SET hash_algorithm = ?, hash_digest = ?, hash_proof = ?, verified_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(hash.algorithm)
        .bind(&hash.digest)
        .bind(&hash.proof)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RequestError::NotFound(id));
        }
        Ok(())
    }

    /// Finish a request as `Completed` or `Duplicate`. Refused unless the
    /// hash was verified from stored bytes. Repeating the same status is a
    /// no-op; any other terminal status is final.
    pub async fn complete_request(
        &self,
        id: i64,
        status: RequestStatus,
    ) -> Result<(), RequestError> {
        let result = sqlx::query(
            "UPDATE requests SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND verified_at IS NOT NULL
               AND (status = ?1 OR status NOT IN ('completed', 'failed', 'duplicate'))",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return match self.get_request(id).await? {
                None => Err(RequestError::NotFound(id)),
                Some(request) if request.status.is_terminal() => Err(RequestError::AlreadyFinished {
                    id,
                    status: request.status,
                }),
                Some(_) => Err(RequestError::NotVerified(id)),
            };
        }
        Ok(())
    }

    /// Refresh the last-activity timestamp.
    pub async fn touch(&self, id: i64) -> Result<(), RequestError> {
        sqlx::query("UPDATE requests SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Delete a request; extension rows go with it.
    pub async fn delete_request(&self, id: i64) -> Result<(), RequestError> {
        sqlx::query("DELETE FROM requests WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn list_by_status(
        &self,
        operation: RequestOperation,
        status: RequestStatus,
    ) -> Result<Vec<Request>, RequestError> {
        Ok(sqlx::query_as::<_, Request>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests
             WHERE operation = ? AND status = ? ORDER BY id ASC"
        ))
        .bind(operation)
        .bind(status)
        .fetch_all(&self.db)
        .await?)
    }

    /// Requests in `status` with no activity since `cutoff`.
    pub async fn list_inactive(
        &self,
        operation: RequestOperation,
        status: RequestStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Request>, RequestError> {
        Ok(self
            .list_by_status(operation, status)
            .await?
            .into_iter()
            .filter(|r| r.updated_at < cutoff)
            .collect())
    }
}

async fn insert_request(
    conn: &mut SqliteConnection,
    operation: RequestOperation,
    new: &NewRequest,
) -> Result<Request, RequestError> {
    let now = Utc::now();
    Ok(sqlx::query_as::<_, Request>(&format!(
        "INSERT INTO requests (
            operation, protocol, status, hash_algorithm, hash_digest, hash_proof,
            size, mime_type, source_ip, user_id, verified_at, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
         RETURNING {REQUEST_COLUMNS}"
    ))
    .bind(operation)
    .bind(&new.protocol)
    .bind(RequestStatus::Pending)
    .bind(new.hash.as_ref().map(|h| h.algorithm))
    .bind(new.hash.as_ref().map(|h| h.digest.clone()))
    .bind(new.hash.as_ref().and_then(|h| h.proof.clone()))
    .bind(new.size as i64)
    .bind(&new.mime_type)
    .bind(&new.source_ip)
    .bind(&new.user_id)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?)
}

/// Lookup criteria for chunked-upload data.
#[derive(Debug, Clone, Default)]
pub struct ChunkedUploadQuery {
    pub session_id: Option<String>,
    pub completed: Option<bool>,
}

impl ChunkedUploadQuery {
    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            completed: None,
        }
    }
}

/// Extension data for [`RequestOperation::ChunkedUpload`].
#[derive(Clone)]
pub struct ChunkedUploadDataHandler {
    db: SqlitePool,
}

impl ChunkedUploadDataHandler {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn find_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ChunkedUploadData>, RequestError> {
        Ok(self
            .query(&ChunkedUploadQuery::session(session_id))
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl DataHandler for ChunkedUploadDataHandler {
    type Data = ChunkedUploadData;
    type Query = ChunkedUploadQuery;

    const OPERATION: RequestOperation = RequestOperation::ChunkedUpload;

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        request_id: i64,
        data: &ChunkedUploadData,
    ) -> Result<(), RequestError> {
        sqlx::query(
            "INSERT INTO chunked_uploads (request_id, session_id, completed) VALUES (?, ?, ?)",
        )
        .bind(request_id)
        .bind(&data.session_id)
        .bind(data.completed)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn get(&self, request_id: i64) -> Result<Option<ChunkedUploadData>, RequestError> {
        Ok(sqlx::query_as::<_, ChunkedUploadData>(
            "SELECT request_id, session_id, completed FROM chunked_uploads WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn update(&self, request_id: i64, data: &ChunkedUploadData) -> Result<(), RequestError> {
        sqlx::query("UPDATE chunked_uploads SET completed = ? WHERE request_id = ?")
            .bind(data.completed)
            .bind(request_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete(&self, request_id: i64) -> Result<(), RequestError> {
        sqlx::query("DELETE FROM chunked_uploads WHERE request_id = ?")
            .bind(request_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn query(&self, query: &ChunkedUploadQuery) -> Result<Vec<ChunkedUploadData>, RequestError> {
        Ok(sqlx::query_as::<_, ChunkedUploadData>(
            "SELECT request_id, session_id, completed FROM chunked_uploads
             WHERE (?1 IS NULL OR session_id = ?1) AND (?2 IS NULL OR completed = ?2)
             ORDER BY request_id ASC",
        )
        .bind(&query.session_id)
        .bind(query.completed)
        .fetch_all(&self.db)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hash::HashAlgorithm;

    async fn setup() -> (tempfile::TempDir, RequestService, ChunkedUploadDataHandler) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("r.db").display());
        let db = crate::db::connect(&url, 2).await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        (dir, RequestService::new(db.clone()), ChunkedUploadDataHandler::new(db))
    }

    fn new_request() -> NewRequest {
        NewRequest {
            protocol: "s5".into(),
            hash: Some(StorageHash::new(HashAlgorithm::Blake3, vec![1u8; 32])),
            size: 42,
            mime_type: Some("text/plain".into()),
            source_ip: None,
            user_id: Some("alice".into()),
        }
    }

    #[tokio::test]
    async fn completion_requires_verification() {
        let (_dir, requests, chunked) = setup().await;
        let data = ChunkedUploadData {
            request_id: 0,
            session_id: "s1".into(),
            completed: false,
        };
        let request = requests.create_request(new_request(), &chunked, &data).await.unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.operation, RequestOperation::ChunkedUpload);
        assert!(!request.is_verified());

        let err = requests
            .complete_request(request.id, RequestStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::NotVerified(_)));

        let hash = request.hash().unwrap();
        requests.mark_verified(request.id, &hash).await.unwrap();
        requests
            .complete_request(request.id, RequestStatus::Completed)
            .await
            .unwrap();
        let done = requests.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(done.status, RequestStatus::Completed);

        // terminal statuses stick
        requests
            .update_status(request.id, RequestStatus::Processing)
            .await
            .unwrap();
        let still = requests.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(still.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn failed_request_cannot_be_completed() {
        let (_dir, requests, chunked) = setup().await;
        let data = ChunkedUploadData {
            request_id: 0,
            session_id: "s3".into(),
            completed: false,
        };
        let request = requests.create_request(new_request(), &chunked, &data).await.unwrap();
        requests.mark_verified(request.id, &request.hash().unwrap()).await.unwrap();
        requests
            .update_status(request.id, RequestStatus::Failed)
            .await
            .unwrap();

        let err = requests
            .complete_request(request.id, RequestStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RequestError::AlreadyFinished {
                status: RequestStatus::Failed,
                ..
            }
        ));
        let still = requests.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(still.status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn completing_twice_with_the_same_status_is_accepted() {
        let (_dir, requests, chunked) = setup().await;
        let data = ChunkedUploadData {
            request_id: 0,
            session_id: "s4".into(),
            completed: false,
        };
        let request = requests.create_request(new_request(), &chunked, &data).await.unwrap();
        requests.mark_verified(request.id, &request.hash().unwrap()).await.unwrap();
        for _ in 0..2 {
            requests
                .complete_request(request.id, RequestStatus::Duplicate)
                .await
                .unwrap();
        }
        assert!(matches!(
            requests.complete_request(request.id, RequestStatus::Completed).await,
            Err(RequestError::AlreadyFinished { .. })
        ));
    }

    #[tokio::test]
    async fn extension_data_follows_its_request() {
        let (_dir, requests, chunked) = setup().await;
        let data = ChunkedUploadData {
            request_id: 0,
            session_id: "s2".into(),
            completed: false,
        };
        let request = requests.create_request(new_request(), &chunked, &data).await.unwrap();

        let found = chunked.find_by_session("s2").await.unwrap().unwrap();
        assert_eq!(found.request_id, request.id);

        chunked
            .update(request.id, &ChunkedUploadData { completed: true, ..found })
            .await
            .unwrap();
        let pending = chunked
            .query(&ChunkedUploadQuery {
                session_id: None,
                completed: Some(false),
            })
            .await
            .unwrap();
        assert!(pending.is_empty());

        requests.delete_request(request.id).await.unwrap();
        assert!(chunked.get(request.id).await.unwrap().is_none());
        assert!(requests.get_request(request.id).await.unwrap().is_none());
    }
}
