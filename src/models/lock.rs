use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Exclusive ownership of one session or resource.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct LockRecord {
    pub lock_id: String,

    /// OS process id of the holder, for operators.
    pub holder_pid: i64,

    /// Unique per acquisition, so a stale holder can never release a
    /// lock someone else has since taken over.
    pub holder_token: String,

    /// Unix millis.
    pub acquired_at: i64,

    /// Unix millis; past this the record may be reclaimed.
    pub expires_at: i64,

    /// Another party asked the holder to wind down.
    pub release_requested: bool,
}
