mod common;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use tempfile::TempDir;
use tower::ServiceExt;
use upload_portal::{
    backends,
    handlers::tus_handlers::{TUS_VERSION, USER_HEADER},
    models::hash::{HashAlgorithm, StorageHash},
    portal::Portal,
};

const BASE: &str = "/upload/tus";

async fn portal(dir: &TempDir) -> Portal {
    let config = common::test_config(dir);
    let db = common::test_db(dir).await;
    let buffer = backends::from_config(&config.buffer).await.unwrap();
    let durable = backends::from_config(&config.durable).await.unwrap();
    let portal = Portal::build(&config, db, buffer, durable).await.unwrap();
    portal.start().await.unwrap();
    portal
}

fn metadata_for(data: &[u8]) -> String {
    let hash = StorageHash::new(HashAlgorithm::Blake3, blake3::hash(data).as_bytes().to_vec());
    format!(
        "hash {},filename {}",
        STANDARD.encode(hash.to_base64url()),
        STANDARD.encode("notes.txt")
    )
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn header_str<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn create(app: &Router, data: &[u8]) -> Response {
    send(
        app,
        Request::builder()
            .method(Method::POST)
            .uri(BASE)
            .header("tus-resumable", TUS_VERSION)
            .header("upload-length", data.len().to_string())
            .header("upload-metadata", metadata_for(data))
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

fn patch(location: &str, offset: u64, chunk: &[u8]) -> Request<Body> {
    Request::builder()
        .method(Method::PATCH)
        .uri(location)
        .header("tus-resumable", TUS_VERSION)
        .header("upload-offset", offset.to_string())
        .header(header::CONTENT_TYPE, "application/offset+octet-stream")
        .body(Body::from(chunk.to_vec()))
        .unwrap()
}

fn head(location: &str) -> Request<Body> {
    Request::builder()
        .method(Method::HEAD)
        .uri(location)
        .header("tus-resumable", TUS_VERSION)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn options_advertises_protocol() {
    let dir = TempDir::new().unwrap();
    let portal = portal(&dir).await;
    let app = portal.router();

    let response = send(
        &app,
        Request::builder()
            .method(Method::OPTIONS)
            .uri(BASE)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "tus-version"), TUS_VERSION);
    assert_eq!(header_str(&response, "tus-resumable"), TUS_VERSION);
    assert!(header_str(&response, "tus-extension").contains("termination"));
    portal.shutdown().await;
}

#[tokio::test]
async fn upload_in_chunks_over_http() {
    let dir = TempDir::new().unwrap();
    let portal = portal(&dir).await;
    let app = portal.router();
    let data: Vec<u8> = (0..30u8).collect();

    let created = create(&app, &data).await;
    assert_eq!(created.status(), StatusCode::CREATED);
    assert_eq!(header_str(&created, "upload-offset"), "0");
    let location = header_str(&created, "location").to_string();
    assert!(location.starts_with(&format!("{BASE}/")));

    let first = send(&app, patch(&location, 0, &data[..12])).await;
    assert_eq!(first.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&first, "upload-offset"), "12");

    let stale = send(&app, patch(&location, 5, &data[5..])).await;
    assert_eq!(stale.status(), StatusCode::CONFLICT);

    let status = send(&app, head(&location)).await;
    assert_eq!(status.status(), StatusCode::OK);
    assert_eq!(header_str(&status, "upload-offset"), "12");
    assert_eq!(header_str(&status, "upload-length"), "30");
    assert_eq!(header_str(&status, "cache-control"), "no-store");

    let rest = send(&app, patch(&location, 12, &data[12..])).await;
    assert_eq!(rest.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&rest, "upload-offset"), "30");

    portal.shutdown().await;
}

#[tokio::test]
async fn terminated_session_is_gone() {
    let dir = TempDir::new().unwrap();
    let portal = portal(&dir).await;
    let app = portal.router();
    let data = b"to be deleted".to_vec();

    let created = create(&app, &data).await;
    let location = header_str(&created, "location").to_string();
    send(&app, patch(&location, 0, &data[..4])).await;

    let deleted = send(
        &app,
        Request::builder()
            .method(Method::DELETE)
            .uri(&location)
            .header("tus-resumable", TUS_VERSION)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let status = send(&app, head(&location)).await;
    assert_eq!(status.status(), StatusCode::NOT_FOUND);
    portal.shutdown().await;
}

#[tokio::test]
async fn protocol_violations_are_refused() {
    let dir = TempDir::new().unwrap();
    let portal = portal(&dir).await;
    let app = portal.router();
    let data = b"payload".to_vec();

    let unversioned = send(
        &app,
        Request::builder()
            .method(Method::POST)
            .uri(BASE)
            .header("upload-length", "7")
            .header("upload-metadata", metadata_for(&data))
            .header(USER_HEADER, "alice")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(unversioned.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(header_str(&unversioned, "tus-resumable"), TUS_VERSION);

    let anonymous = send(
        &app,
        Request::builder()
            .method(Method::POST)
            .uri(BASE)
            .header("tus-resumable", TUS_VERSION)
            .header("upload-length", "7")
            .header("upload-metadata", metadata_for(&data))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(anonymous.status(), StatusCode::BAD_REQUEST);

    let created = create(&app, &data).await;
    let location = header_str(&created, "location").to_string();
    let wrong_type = send(
        &app,
        Request::builder()
            .method(Method::PATCH)
            .uri(&location)
            .header("tus-resumable", TUS_VERSION)
            .header("upload-offset", "0")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(data.clone()))
            .unwrap(),
    )
    .await;
    assert_eq!(wrong_type.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let overflow = send(&app, patch(&location, 0, b"payload and more")).await;
    assert_eq!(overflow.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let missing = send(&app, head(&format!("{BASE}/0123456789abcdef"))).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    portal.shutdown().await;
}

#[tokio::test]
async fn health_checks_report_healthy_portal() {
    let dir = TempDir::new().unwrap();
    let portal = portal(&dir).await;
    let app = portal.router();

    for path in ["/healthz", "/readyz"] {
        let response = send(
            &app,
            Request::builder().uri(path).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }
    portal.shutdown().await;
}
