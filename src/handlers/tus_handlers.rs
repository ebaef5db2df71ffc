//! Resumable upload endpoints (TUS 1.0.0, `creation` and `termination`).
//!
//! - `OPTIONS {base}`: protocol discovery
//! - `POST    {base}`: create a session
//! - `HEAD    {base}/{id}`: current offset
//! - `PATCH   {base}/{id}`: append bytes at `Upload-Offset`
//! - `DELETE  {base}/{id}`: terminate

use crate::{
    errors::AppError,
    portal::AppState,
    services::chunked_upload::NewSession,
};
use axum::{
    body::Body,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use futures::StreamExt;
use std::{collections::HashMap, io};
use tokio_util::io::StreamReader;

pub const TUS_VERSION: &str = "1.0.0";
const TUS_EXTENSIONS: &str = "creation,termination";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Identity of the uploader, set by the authentication layer in front of us.
pub const USER_HEADER: &str = "x-portal-user";

static TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
static TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
static TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
static TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
static UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
static UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
static UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
static UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");

/// `OPTIONS {base}`
pub async fn tus_options(State(state): State<AppState>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(TUS_VERSION_HEADER.clone(), HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_EXTENSION.clone(), HeaderValue::from_static(TUS_EXTENSIONS));
    headers.insert(
        TUS_MAX_SIZE.clone(),
        HeaderValue::from(state.uploads.settings().max_upload_size),
    );
    response
}

/// `POST {base}`
pub async fn create_upload(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_version(&headers)?;
    if headers.contains_key(&UPLOAD_DEFER_LENGTH) {
        return Err(AppError::bad_request("deferred upload length is not supported"));
    }
    let size = header_u64(&headers, &UPLOAD_LENGTH)?
        .ok_or_else(|| AppError::bad_request("missing Upload-Length"))?;
    let metadata = match headers.get(&UPLOAD_METADATA) {
        Some(value) => parse_metadata(
            value
                .to_str()
                .map_err(|_| AppError::bad_request("invalid Upload-Metadata"))?,
        )?,
        None => HashMap::new(),
    };

    let info = state
        .uploads
        .create_session(NewSession {
            size,
            metadata,
            user_id: header_str(&headers, USER_HEADER),
            source_ip: source_ip(&headers),
        })
        .await?;

    let location = format!("{}/{}", uri.path().trim_end_matches('/'), info.id);
    let mut response = StatusCode::CREATED.into_response();
    let out = response.headers_mut();
    out.insert(
        header::LOCATION,
        HeaderValue::from_str(&location).map_err(|e| AppError::internal(e.to_string()))?,
    );
    out.insert(UPLOAD_OFFSET.clone(), HeaderValue::from(info.offset));
    Ok(response)
}

/// `HEAD {base}/{id}`
pub async fn head_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_version(&headers)?;
    let info = state.uploads.session_status(&id).await?;

    let mut response = StatusCode::OK.into_response();
    let out = response.headers_mut();
    out.insert(UPLOAD_OFFSET.clone(), HeaderValue::from(info.offset));
    out.insert(UPLOAD_LENGTH.clone(), HeaderValue::from(info.size));
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// `PATCH {base}/{id}`
pub async fn patch_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    check_version(&headers)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != OFFSET_CONTENT_TYPE {
        return Err(AppError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("Content-Type must be {OFFSET_CONTENT_TYPE}"),
        ));
    }
    let offset = header_u64(&headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| AppError::bad_request("missing Upload-Offset"))?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let info = state
        .uploads
        .write(&id, offset, StreamReader::new(stream))
        .await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    response
        .headers_mut()
        .insert(UPLOAD_OFFSET.clone(), HeaderValue::from(info.offset));
    Ok(response)
}

/// `DELETE {base}/{id}`
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_version(&headers)?;
    state.uploads.terminate(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Stamp every protocol response with the version it speaks.
pub async fn add_tus_resumable(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(TUS_RESUMABLE.clone(), HeaderValue::from_static(TUS_VERSION));
    response
}

fn check_version(headers: &HeaderMap) -> Result<(), AppError> {
    match headers.get(&TUS_RESUMABLE).and_then(|v| v.to_str().ok()) {
        Some(TUS_VERSION) => Ok(()),
        _ => Err(AppError::new(
            StatusCode::PRECONDITION_FAILED,
            format!("Tus-Resumable must be {TUS_VERSION}"),
        )),
    }
}

pub(crate) fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, AppError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| AppError::bad_request(format!("invalid {name} header")))
        })
        .transpose()
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
pub(crate) fn source_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
}

/// `key base64(value)` pairs separated by commas; a bare key has an empty value.
fn parse_metadata(raw: &str) -> Result<HashMap<String, String>, AppError> {
    let mut metadata = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default().trim();
        if key.is_empty() {
            return Err(AppError::bad_request("invalid Upload-Metadata key"));
        }
        let value = match parts.next().map(str::trim).filter(|v| !v.is_empty()) {
            Some(encoded) => {
                let bytes = general_purpose::STANDARD.decode(encoded).map_err(|_| {
                    AppError::bad_request(format!("invalid Upload-Metadata value for `{key}`"))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    AppError::bad_request(format!("Upload-Metadata value for `{key}` is not UTF-8"))
                })?
            }
            None => String::new(),
        };
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_metadata_pairs() {
        let parsed = parse_metadata("filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,is_confidential, mimeType dGV4dC9wbGFpbg==").unwrap();
        assert_eq!(parsed["filename"], "world_domination_plan.pdf");
        assert_eq!(parsed["is_confidential"], "");
        assert_eq!(parsed["mimeType"], "text/plain");
        assert!(parse_metadata("key !!!").is_err());
    }

    #[test]
    fn source_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(source_ip(&headers).as_deref(), Some("10.0.0.9"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(source_ip(&headers).as_deref(), Some("203.0.113.7"));
    }
}
