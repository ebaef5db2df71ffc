use crate::{
    errors::AppError,
    handlers::tus_handlers::{USER_HEADER, header_str, source_ip},
    models::hash::StorageHash,
    portal::AppState,
    services::file_service::SmallUpload,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio_util::io::ReaderStream;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Serialize)]
pub struct PostUploadResponse {
    /// Base64url multihash of the stored content.
    pub hash: String,
    pub size: u64,
    pub duplicate: bool,
}

/// `POST /upload`: store the request body as one file.
pub async fn post_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let mime_type = header_str(&headers, header::CONTENT_TYPE.as_str())
        .filter(|m| m != OCTET_STREAM);
    let posted = state
        .files
        .put_small(SmallUpload {
            data: body,
            mime_type,
            user_id: header_str(&headers, USER_HEADER),
            source_ip: source_ip(&headers),
        })
        .await?;

    let status = if posted.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let body = PostUploadResponse {
        hash: posted.hash.to_base64url(),
        size: posted.size,
        duplicate: posted.duplicate,
    };
    Ok((status, Json(body)).into_response())
}

/// `POST /pins/{hash}`: pin stored content for the caller.
pub async fn pin_file(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let hash = parse_hash(&hash)?;
    let added = state
        .files
        .pin(&hash, header_str(&headers, USER_HEADER), source_ip(&headers))
        .await?;
    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(status.into_response())
}

/// `GET /files/{hash}`, honouring an open-ended `Range: bytes=N-`.
pub async fn get_file(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let hash = parse_hash(&hash)?;
    let start = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(range_start)
        .unwrap_or(0);
    let file = state.files.get_file(&hash, start).await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file.reader)));
    let out = response.headers_mut();
    let content_type = file.mime_type.as_deref().unwrap_or(OCTET_STREAM);
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(OCTET_STREAM)),
    );
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(file.size - file.start));
    if file.start > 0 {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        let range = format!("bytes {}-{}/{}", file.start, file.size - 1, file.size);
        response.headers_mut().insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&range).map_err(|e| AppError::internal(e.to_string()))?,
        );
    }
    Ok(response)
}

/// Base64url multihash, with or without the `u` multibase prefix.
fn parse_hash(raw: &str) -> Result<StorageHash, AppError> {
    StorageHash::from_base64url(raw)
        .or_else(|err| match raw.strip_prefix('u') {
            Some(rest) => StorageHash::from_base64url(rest),
            None => Err(err),
        })
        .map_err(|err| AppError::bad_request(format!("invalid hash: {err}")))
}

/// Start of a `bytes=N-` range. Other forms are ignored and the whole
/// object is served.
fn range_start(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let start = spec.strip_suffix('-')?;
    start.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hash::HashAlgorithm;

    #[test]
    fn only_open_ended_ranges_are_honoured() {
        assert_eq!(range_start("bytes=10-"), Some(10));
        assert_eq!(range_start("bytes=0-"), Some(0));
        assert_eq!(range_start("bytes=10-20"), None);
        assert_eq!(range_start("bytes=-5"), None);
        assert_eq!(range_start("items=1-"), None);
    }

    #[test]
    fn hashes_parse_with_or_without_multibase_prefix() {
        let hash = StorageHash::new(HashAlgorithm::Blake3, vec![7u8; 32]);
        let encoded = hash.to_base64url();
        assert_eq!(parse_hash(&encoded).unwrap(), hash);
        assert_eq!(parse_hash(&format!("u{encoded}")).unwrap(), hash);
        assert_eq!(parse_hash("not-a-hash").unwrap_err().status, StatusCode::BAD_REQUEST);
    }
}
