//! Core data models for the upload portal.
//!
//! Persisted entities map to database tables via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde`.

pub mod hash;
pub mod job;
pub mod lock;
pub mod multipart;
pub mod request;
pub mod session;
pub mod upload;
