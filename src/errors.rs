use crate::services::error::TransferError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::fmt;

const INTERNAL_MESSAGE: &str = "Internal server error";

/// Error returned by every handler. Only `message` and `details` ever reach
/// the client.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Extra fields merged into the JSON envelope.
    pub details: Option<Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            details: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Generic 500. The cause must already be logged.
    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let (Some(Value::Object(extra)), Some(envelope)) = (self.details, body.as_object_mut())
        {
            envelope.extend(extra);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        if err.is_internal() {
            tracing::error!("request failed: {}", err);
            return AppError::internal();
        }

        let status = match &err {
            TransferError::Validation(_) | TransferError::InvalidVerificationCode => {
                StatusCode::BAD_REQUEST
            }
            TransferError::NotFoundOrExpired | TransferError::NoChunks(_) => StatusCode::NOT_FOUND,
            TransferError::PasswordRequired
            | TransferError::InvalidPassword
            | TransferError::InvalidPin
            | TransferError::AlreadyUsed
            | TransferError::SenderNotVerified(_) => StatusCode::FORBIDDEN,
            TransferError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match err {
            TransferError::RateLimitExceeded(check) => {
                let message = check
                    .message
                    .clone()
                    .unwrap_or_else(|| "Upload limit exceeded".into());
                AppError::new(status, message).with_details(json!({
                    "remaining_bytes": check.remaining_bytes,
                    "reset_in": check.reset_in,
                }))
            }
            other => AppError::new(status, other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("request failed: {:#}", err);
        AppError::internal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{object_storage::StorageError, rate_limit::LimitCheck};
    use axum::body::to_bytes;

    async fn body_json(err: AppError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn internal_errors_never_leak_their_cause() {
        let err: AppError =
            TransferError::Storage(StorageError::Remote("bucket secret-bucket is gone".into()))
                .into();
        let (status, body) = body_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], INTERNAL_MESSAGE);
        assert_eq!(body["success"], false);
        assert!(!body.to_string().contains("secret-bucket"));
    }

    #[tokio::test]
    async fn access_errors_map_to_client_statuses() {
        let cases = [
            (TransferError::NotFoundOrExpired, StatusCode::NOT_FOUND),
            (TransferError::NoChunks("gone".into()), StatusCode::NOT_FOUND),
            (TransferError::PasswordRequired, StatusCode::FORBIDDEN),
            (TransferError::InvalidPassword, StatusCode::FORBIDDEN),
            (TransferError::InvalidPin, StatusCode::FORBIDDEN),
            (TransferError::AlreadyUsed, StatusCode::FORBIDDEN),
            (TransferError::validation("bad"), StatusCode::BAD_REQUEST),
            (TransferError::InvalidVerificationCode, StatusCode::BAD_REQUEST),
            (
                TransferError::SenderNotVerified("a@example.com".into()),
                StatusCode::FORBIDDEN,
            ),
            (TransferError::EmptyContent(3), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }

    #[tokio::test]
    async fn rate_limit_errors_carry_quota_details() {
        let check = LimitCheck {
            allowed: false,
            remaining_bytes: 512,
            reset_in: 90,
            message: Some("no room".into()),
        };
        let (status, body) = body_json(TransferError::RateLimitExceeded(check).into()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "no room");
        assert_eq!(body["remaining_bytes"], 512);
        assert_eq!(body["reset_in"], 90);
        assert_eq!(body["status"], 429);
    }
}
