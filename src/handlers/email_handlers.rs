//! Sender email verification endpoints.

use crate::{errors::AppError, state::AppState};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub email: String,
}

/// POST `/api/email/request`: mail a fresh code to the address.
pub async fn request_code(
    State(state): State<AppState>,
    Json(req): Json<CodeRequest>,
) -> Result<Json<Value>, AppError> {
    state.email.request_code(&req.email).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Verification code sent",
    })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub email: String,
    pub code: String,
}

/// POST `/api/email/verify`
pub async fn verify_code(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<Value>, AppError> {
    state.email.verify(&req.email, &req.code).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Email verified",
    })))
}

/// GET `/api/email/{email}`
pub async fn check_verification(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<Value>, AppError> {
    let is_verified = state.email.is_verified(&email).await?;
    Ok(Json(json!({ "success": true, "is_verified": is_verified })))
}
