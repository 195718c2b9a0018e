//! Defines routes for the upload coordinator.
//!
//! ## Structure
//! - **Session endpoints**
//!   - `POST   /uploads/initiate`    — open or resume an upload session
//!   - `POST   /uploads/presign`     — authorizations for the missing parts
//!   - `POST   /uploads/acknowledge` — record one transferred part
//!   - `POST   /uploads/complete`    — validate part list and assemble
//!   - `POST   /uploads/abort`       — discard the session
//!
//! - **Stored-object endpoints**
//!   - `GET    /uploads/list`    — stored objects with read URLs
//!   - `DELETE /uploads/destroy` — remove a stored object (`?key=`)
//!
//! - **Backend endpoints** (memory backend only)
//!   - `PUT    /backend/{*key}` — authorized part write
//!   - `GET    /backend/{*key}` — authorized object read
//!
//! The wildcard `*key` allows nested keys like `uploads/<uuid>/video.mp4`.

use std::sync::Arc;

use crate::{
    handlers::{
        backend_handlers,
        health_handlers::{healthz, readyz},
        upload_handlers::{
            abort_upload, acknowledge_part, complete_upload, destroy_upload, initiate_upload,
            list_uploads, presign_parts,
        },
    },
    services::upload_service::UploadService,
    storage::memory::MemoryBackend,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build and return the router for the coordinator's API.
///
/// The router carries shared state (`UploadService`) to all handlers.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // session protocol
        .route("/uploads/initiate", post(initiate_upload))
        .route("/uploads/presign", post(presign_parts))
        .route("/uploads/acknowledge", post(acknowledge_part))
        .route("/uploads/complete", post(complete_upload))
        .route("/uploads/abort", post(abort_upload))
        // stored objects
        .route("/uploads/list", get(list_uploads))
        .route("/uploads/destroy", delete(destroy_upload))
}

/// Routes terminating the memory backend's authorization URLs. Mounted only
/// when that backend is configured; the S3 backend signs URLs pointing at
/// S3 itself.
pub fn backend_routes(backend: Arc<MemoryBackend>) -> Router {
    Router::new()
        .route(
            "/backend/{*key}",
            put(backend_handlers::put_part).get(backend_handlers::get_object),
        )
        .with_state(backend)
}
