//! QR/PIN direct transfer endpoints.

use super::{Disposition, file_response, spawn_purge};
use crate::{errors::AppError, state::AppState};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub files: Vec<i64>,
}

/// POST `/api/direct/generate`
pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<Value>, AppError> {
    let ticket = state.direct.generate(&req.files).await?;
    Ok(Json(json!({
        "success": true,
        "token": ticket.token,
        "pin": ticket.pin,
        "qr_data": ticket.qr_data,
        "expires_at": ticket.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    pub pin: String,
}

/// POST `/api/direct/{token}/validate`
pub async fn validate_pin(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<PinRequest>,
) -> Result<Json<Value>, AppError> {
    let files = state.direct.validate_pin(&token, &req.pin).await?;
    Ok(Json(json!({ "success": true, "files": files })))
}

/// GET `/api/direct/{token}`
pub async fn find_transfer(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Value>, AppError> {
    let listing = state.direct.find_transfer(&token).await?;
    Ok(Json(json!({
        "success": true,
        "token": listing.token,
        "expires_at": listing.expires_at,
        "files": listing.files,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DirectDownloadParams {
    pub pin: String,
    pub file_id: i64,
}

/// GET `/api/direct/{token}/download?file_id=&pin=`
pub async fn download(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<DirectDownloadParams>,
) -> Result<Response, AppError> {
    let mut download = state
        .direct
        .download(&token, &params.pin, params.file_id)
        .await?;
    let purge = download.purge.take();
    let response = file_response(download, Disposition::Attachment);
    if let Some(target) = purge {
        spawn_purge(&state, target);
    }
    Ok(response)
}
