//! Link and email transfer endpoints.

use super::{Disposition, file_response, spawn_purge};
use crate::{
    errors::AppError,
    models::transfer::{NewTransfer, TransferKind},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    pub files: Vec<i64>,
    pub message: Option<String>,
    pub password: Option<String>,
    /// Days until expiry: 1, 2 or 3.
    pub expires_in: Option<u32>,
    #[serde(default)]
    pub single_download: bool,
    pub sender_email: Option<String>,
    pub recipient_email: Option<String>,
}

impl CreateTransferRequest {
    fn into_new_transfer(self, kind: TransferKind) -> NewTransfer {
        let (sender_email, recipient_email) = match kind {
            TransferKind::Email => (self.sender_email, self.recipient_email),
            TransferKind::Link => (None, None),
        };
        NewTransfer {
            kind,
            file_ids: self.files,
            message: self.message,
            password: self.password,
            sender_email,
            recipient_email,
            expires_in_days: self.expires_in,
            single_download: self.single_download,
        }
    }
}

/// POST `/api/transfers/link`
pub async fn create_link_transfer(
    State(state): State<AppState>,
    Json(req): Json<CreateTransferRequest>,
) -> Result<Json<Value>, AppError> {
    let created = state
        .transfers
        .create(req.into_new_transfer(TransferKind::Link))
        .await?;
    Ok(Json(json!({
        "success": true,
        "download_token": created.download_token,
        "download_link": state.download_link(&created.download_token),
        "expires_at": created.expires_at,
    })))
}

/// POST `/api/transfers/email`: the link is only sent to the recipient.
pub async fn create_email_transfer(
    State(state): State<AppState>,
    Json(req): Json<CreateTransferRequest>,
) -> Result<Json<Value>, AppError> {
    let created = state
        .transfers
        .create(req.into_new_transfer(TransferKind::Email))
        .await?;
    Ok(Json(json!({
        "success": true,
        "expires_at": created.expires_at,
    })))
}

/// GET `/api/transfers/{token}`: status without consuming anything.
pub async fn transfer_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Value>, AppError> {
    let status = state.transfers.check_transfer(&token).await?;
    Ok(Json(json!({ "success": true, "transfer": status })))
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadParams {
    pub password: Option<String>,
    pub file_id: Option<i64>,
}

async fn serve_download(
    state: AppState,
    token: String,
    params: DownloadParams,
) -> Result<Response, AppError> {
    let mut download = state
        .transfers
        .download(&token, params.password.as_deref(), params.file_id)
        .await?;
    let purge = download.purge.take();
    let response = file_response(download, Disposition::Inline);
    if let Some(target) = purge {
        spawn_purge(&state, target);
    }
    Ok(response)
}

/// GET `/api/download/{token}?password=&file_id=`
pub async fn download(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, AppError> {
    serve_download(state, token, params).await
}

/// POST `/api/download/{token}` with the password in the body.
pub async fn download_with_body(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(params): Json<DownloadParams>,
) -> Result<Response, AppError> {
    serve_download(state, token, params).await
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    pub password: Option<String>,
}

/// DELETE `/api/transfers/{token}?password=`: withdraw a transfer early.
pub async fn delete_transfer(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Value>, AppError> {
    state
        .transfers
        .delete_transfer(&token, params.password.as_deref())
        .await?;
    Ok(Json(json!({ "success": true })))
}
