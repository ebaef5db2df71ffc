//! Defines the portal's HTTP routes.
//!
//! ## Structure
//! - **Health**
//!   - `GET /healthz`, `GET /readyz`
//!
//! - **Files**
//!   - `POST /upload`: single-request upload
//!   - `GET  /files/{hash}`: read by hash
//!   - `POST /pins/{hash}`: pin stored content
//!
//! - **Resumable uploads** (mounted under the configured base path)
//!   - `OPTIONS {base}`: protocol discovery
//!   - `POST    {base}`: create session
//!   - `HEAD    {base}/{id}`: current offset
//!   - `PATCH   {base}/{id}`: append bytes
//!   - `DELETE  {base}/{id}`: terminate session

use crate::{
    handlers::{
        file_handlers::{get_file, pin_file, post_upload},
        health_handlers::{healthz, readyz},
        tus_handlers::{
            add_tus_resumable, create_upload, delete_upload, head_upload, patch_upload,
            tus_options,
        },
    },
    portal::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, options, patch, post},
};

/// Build the router; `base_path` is where the resumable endpoints live and
/// `max_post_size` caps single-request upload bodies.
pub fn routes(base_path: &str, max_post_size: u64) -> Router<AppState> {
    let base = format!("/{}", base_path.trim_matches('/'));

    let tus = Router::new()
        .route(&base, options(tus_options).post(create_upload))
        .route(
            &format!("{base}/{{id}}"),
            patch(patch_upload).head(head_upload).delete(delete_upload),
        )
        .layer(middleware::map_response(add_tus_resumable));

    let body_limit = usize::try_from(max_post_size).unwrap_or(usize::MAX);
    let files = Router::new()
        .route(
            "/upload",
            post(post_upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/files/{hash}", get(get_file))
        .route("/pins/{hash}", post(pin_file));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(files)
        .merge(tus)
}
