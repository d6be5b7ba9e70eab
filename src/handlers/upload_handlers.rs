//! Chunked upload endpoints, finalization and the per-IP quota check.

use super::ClientIp;
use crate::{
    errors::AppError,
    models::upload::{BatchUpload, UploadProgress},
    services::error::TransferError,
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAccepted {
    pub success: bool,
    pub upload_id: String,
    pub chunk: u32,
    #[serde(flatten)]
    pub progress: UploadProgress,
}

/// Multipart fields of a chunk upload.
#[derive(Debug, Default)]
struct ChunkForm {
    file: Option<Bytes>,
    chunk: Option<u32>,
    total_chunks: Option<u32>,
    upload_id: Option<String>,
}

fn parse_number(field: &str, raw: &str) -> Result<u32, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("`{field}` must be a non-negative integer")))
}

async fn read_chunk_form(mut multipart: Multipart) -> Result<ChunkForm, AppError> {
    let mut form = ChunkForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let malformed = |err: axum::extract::multipart::MultipartError| {
            AppError::bad_request(format!("invalid `{name}` field: {err}"))
        };
        match name.as_str() {
            "file" => form.file = Some(field.bytes().await.map_err(malformed)?),
            "chunk" => {
                form.chunk = Some(parse_number(
                    "chunk",
                    &field.text().await.map_err(malformed)?,
                )?)
            }
            "totalChunks" => {
                form.total_chunks = Some(parse_number(
                    "totalChunks",
                    &field.text().await.map_err(malformed)?,
                )?)
            }
            "uploadId" => form.upload_id = Some(field.text().await.map_err(malformed)?),
            _ => {}
        }
    }
    Ok(form)
}

/// POST `/api/upload/chunk`: seal and stash one chunk.
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ChunkAccepted>, AppError> {
    let form = read_chunk_form(multipart).await?;
    let (Some(file), Some(chunk), Some(total_chunks), Some(upload_id)) =
        (form.file, form.chunk, form.total_chunks, form.upload_id)
    else {
        return Err(AppError::bad_request(
            "`file`, `chunk`, `totalChunks` and `uploadId` are required",
        ));
    };

    let progress = state
        .chunks
        .store_chunk(&upload_id, chunk, &file, total_chunks)
        .await?;
    Ok(Json(ChunkAccepted {
        success: true,
        upload_id,
        chunk,
        progress,
    }))
}

/// GET `/api/upload/{upload_id}/progress`
pub async fn upload_progress(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Json<Value> {
    let progress = state.chunks.get_upload_progress(&upload_id).await;
    Json(json!({
        "success": true,
        "currentProgress": progress.current_progress,
        "totalChunks": progress.total_chunks,
    }))
}

/// DELETE `/api/upload/{upload_id}`: cancel a session.
pub async fn delete_chunks(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.chunks.delete_chunks(&upload_id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub upload_id: String,
    pub filename: String,
    pub mime_type: String,
}

/// POST `/api/upload/finalize`
pub async fn finalize_upload(
    State(state): State<AppState>,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<Value>, AppError> {
    if req.filename.trim().is_empty() || req.mime_type.trim().is_empty() {
        return Err(AppError::bad_request("`filename` and `mimeType` are required"));
    }

    let finalized = state.chunks.finalize_upload(&req.upload_id).await?;
    let file = state
        .files
        .record_upload(&finalized, &req.filename, &req.mime_type)
        .await?;
    Ok(Json(json!({
        "success": true,
        "fileId": file.id,
        "size": file.size,
        "expiresAt": file.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct FinalizeBatchRequest {
    pub uploads: Vec<BatchUpload>,
}

/// POST `/api/upload/finalize-batch`: the declared total must fit the
/// caller's remaining budget. Once everything is recorded the caller is
/// charged for the bytes actually stored.
pub async fn finalize_batch(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<FinalizeBatchRequest>,
) -> Result<Json<Value>, AppError> {
    if req
        .uploads
        .iter()
        .any(|u| u.filename.trim().is_empty() || u.mime_type.trim().is_empty())
    {
        return Err(AppError::bad_request(
            "every upload needs a `filename` and a `mimeType`",
        ));
    }

    let total_size = req
        .uploads
        .iter()
        .fold(0u64, |sum, upload| sum.saturating_add(upload.total_size));
    let check = state.limiter.can_upload(&ip, total_size).await?;
    if !check.allowed {
        return Err(TransferError::RateLimitExceeded(check).into());
    }

    let finalized = state.chunks.finalize_batch(&req.uploads).await?;
    let files = state.files.record_batch(&req.uploads, &finalized).await?;
    let stored_size = finalized
        .iter()
        .fold(0u64, |sum, upload| sum.saturating_add(upload.size));
    if let Err(err) = state.limiter.track_usage(&ip, stored_size).await {
        tracing::warn!("failed to track upload usage for {}: {}", ip, err);
    }

    let results: Vec<Value> = req
        .uploads
        .iter()
        .zip(&files)
        .map(|(upload, file)| {
            json!({
                "uploadId": upload.upload_id,
                "fileId": file.id,
                "success": true,
            })
        })
        .collect();
    Ok(Json(json!({ "success": true, "files": results })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckLimitRequest {
    pub total_size: u64,
}

/// POST `/api/upload/check-limit`
pub async fn check_limit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CheckLimitRequest>,
) -> Result<Json<Value>, AppError> {
    if req.total_size == 0 {
        return Err(AppError::bad_request("`totalSize` must be at least 1"));
    }
    let check = state.limiter.can_upload(&ip, req.total_size).await?;
    Ok(Json(json!({
        "success": true,
        "allowed": check.allowed,
        "remaining_bytes": check.remaining_bytes,
        "reset_in": check.reset_in,
        "message": check.message,
    })))
}

/// DELETE `/api/files/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    state.files.delete_file(id).await?;
    Ok(Json(json!({ "success": true })))
}
