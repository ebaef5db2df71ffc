use crate::services::{
    chunked_upload::{TusError, UploadError},
    file_service::FileError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = ?err, "request failed");
        AppError::internal("internal server error")
    }
}

impl From<TusError> for AppError {
    fn from(err: TusError) -> Self {
        let status = match &err {
            TusError::NotFound(_) => StatusCode::NOT_FOUND,
            TusError::OffsetMismatch { .. } => StatusCode::CONFLICT,
            TusError::TooLarge { .. } | TusError::Rejected(UploadError::TooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            TusError::Locked(_) => StatusCode::LOCKED,
            TusError::Rejected(_) | TusError::BadRequest(_) => StatusCode::BAD_REQUEST,
            TusError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if let TusError::Internal(inner) = err {
            return inner.into();
        }
        AppError::new(status, err.to_string())
    }
}

impl From<FileError> for AppError {
    fn from(err: FileError) -> Self {
        let status = match &err {
            FileError::NotFound => StatusCode::NOT_FOUND,
            FileError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            FileError::Rejected(UploadError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            FileError::Rejected(inner) if !inner.is_rejection() => StatusCode::INTERNAL_SERVER_ERROR,
            FileError::Rejected(_) => StatusCode::BAD_REQUEST,
            FileError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        match err {
            FileError::Internal(inner) => inner.into(),
            FileError::Rejected(inner) if !inner.is_rejection() => anyhow::Error::from(inner).into(),
            err => AppError::new(status, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tus_errors_map_to_protocol_statuses() {
        let cases = [
            (TusError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                TusError::OffsetMismatch {
                    expected: 1,
                    actual: 2,
                },
                StatusCode::CONFLICT,
            ),
            (TusError::TooLarge { size: 1 }, StatusCode::PAYLOAD_TOO_LARGE),
            (TusError::Locked("x".into()), StatusCode::LOCKED),
            (
                TusError::Rejected(UploadError::Unauthenticated),
                StatusCode::BAD_REQUEST,
            ),
            (
                TusError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn file_errors_map_to_http_statuses() {
        let cases = [
            (FileError::NotFound, StatusCode::NOT_FOUND),
            (
                FileError::RangeNotSatisfiable { start: 9, size: 4 },
                StatusCode::RANGE_NOT_SATISFIABLE,
            ),
            (
                FileError::Rejected(UploadError::TooLarge { size: 9, limit: 4 }),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                FileError::Rejected(UploadError::Unauthenticated),
                StatusCode::BAD_REQUEST,
            ),
            (
                FileError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
