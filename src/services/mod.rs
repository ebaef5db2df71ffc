pub mod chunked_upload;
pub mod content_type;
pub mod events;
pub mod file_service;
pub mod hashing;
pub mod locker;
pub mod partial_uploads;
pub mod pipeline;
pub mod protocol;
pub mod request_service;
pub mod scheduler;
pub mod transfer;
pub mod upload_buffer;
pub mod upload_service;
