//! Defines routes for uploads, transfers and direct transfers.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Uploads**
//!   - `POST   /api/upload/chunk`: multipart chunk (`file`, `chunk`, `totalChunks`, `uploadId`)
//!   - `GET    /api/upload/{upload_id}/progress`
//!   - `DELETE /api/upload/{upload_id}`: cancel a session
//!   - `POST   /api/upload/finalize`, `POST /api/upload/finalize-batch`
//!   - `POST   /api/upload/check-limit`
//!   - `DELETE /api/files/{id}`
//!
//! - **Transfers**
//!   - `POST   /api/transfers/link`, `POST /api/transfers/email`
//!   - `GET    /api/transfers/{token}`: status check
//!   - `DELETE /api/transfers/{token}?password=`: withdraw early
//!   - `GET|POST /api/download/{token}`
//!
//! - **Direct transfers**
//!   - `POST   /api/direct/generate`
//!   - `GET    /api/direct/{token}`
//!   - `POST   /api/direct/{token}/validate`
//!   - `GET    /api/direct/{token}/download?file_id=&pin=`
//!
//! - **Sender verification**
//!   - `POST   /api/email/request`, `POST /api/email/verify`
//!   - `GET    /api/email/{email}`

use crate::{
    handlers::{
        direct_transfer_handlers, email_handlers,
        health_handlers::{healthz, readyz},
        transfer_handlers, upload_handlers,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Largest accepted chunk upload body.
const CHUNK_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Build the router. The router carries shared state (`AppState`) to all
/// handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // uploads
        .route(
            "/api/upload/chunk",
            post(upload_handlers::upload_chunk).layer(DefaultBodyLimit::max(CHUNK_BODY_LIMIT)),
        )
        .route(
            "/api/upload/{upload_id}/progress",
            get(upload_handlers::upload_progress),
        )
        .route(
            "/api/upload/{upload_id}",
            delete(upload_handlers::delete_chunks),
        )
        .route("/api/upload/finalize", post(upload_handlers::finalize_upload))
        .route(
            "/api/upload/finalize-batch",
            post(upload_handlers::finalize_batch),
        )
        .route("/api/upload/check-limit", post(upload_handlers::check_limit))
        .route("/api/files/{id}", delete(upload_handlers::delete_file))
        // transfers
        .route(
            "/api/transfers/link",
            post(transfer_handlers::create_link_transfer),
        )
        .route(
            "/api/transfers/email",
            post(transfer_handlers::create_email_transfer),
        )
        .route(
            "/api/transfers/{token}",
            get(transfer_handlers::transfer_status).delete(transfer_handlers::delete_transfer),
        )
        .route(
            "/api/download/{token}",
            get(transfer_handlers::download).post(transfer_handlers::download_with_body),
        )
        // direct transfers
        .route(
            "/api/direct/generate",
            post(direct_transfer_handlers::generate),
        )
        .route(
            "/api/direct/{token}",
            get(direct_transfer_handlers::find_transfer),
        )
        .route(
            "/api/direct/{token}/validate",
            post(direct_transfer_handlers::validate_pin),
        )
        .route(
            "/api/direct/{token}/download",
            get(direct_transfer_handlers::download),
        )
        // sender verification
        .route("/api/email/request", post(email_handlers::request_code))
        .route("/api/email/verify", post(email_handlers::verify_code))
        .route(
            "/api/email/{email}",
            get(email_handlers::check_verification),
        )
}
