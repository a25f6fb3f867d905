//! Defines routes for the upload API and the signed storage endpoints.
//!
//! ## Structure
//! - **Upload API** (JSON, no file bytes)
//!   - `POST /api/upload/start-upload`
//!   - `GET  /api/upload/part-url?sessionId=&partNumber=`
//!   - `POST /api/upload/complete-upload`
//!   - `POST /api/upload/abort-upload`
//!   - `GET  /api/upload/sessions/{id}`
//!   - `GET  /api/upload/sessions/{id}/view-url`
//!
//! - **Signed storage** (local backend, requires `expires` + `signature`)
//!   - `PUT /storage/{*key}`: single object, or a part with `uploadId` + `partNumber`
//!   - `GET /storage/{*key}`: download
//!
//! The wildcard `*key` allows nested keys like `uploads/2025/report.pdf`.

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    storage_handlers::{get_signed, put_signed},
    upload_handlers::{
        abort_upload, complete_upload, get_session, part_url, start_upload, view_url,
    },
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router for every endpoint. Handlers extract the slice of
/// [`AppState`] they need.
pub fn routes() -> Router<AppState> {
    let api = Router::new()
        .route("/start-upload", post(start_upload))
        .route("/part-url", get(part_url))
        .route("/complete-upload", post(complete_upload))
        .route("/abort-upload", post(abort_upload))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/view-url", get(view_url));

    let storage = Router::new()
        .route("/{*key}", put(put_signed).get(get_signed))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/upload", api)
        .nest("/storage", storage)
}
