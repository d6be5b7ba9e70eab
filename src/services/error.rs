//! src/services/error.rs
//!
//! Error taxonomy shared by the upload, transfer and cleanup services.
//! Expected outcomes (not found, expired, already used, bad credentials)
//! are typed variants; infrastructure failures wrap their source error.

use super::{
    encryption::EncryptionError, kv::KvError, notification::MailError,
    object_storage::StorageError, rate_limit::LimitCheck,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Bad input shape, rejected before any side effect.
    #[error("{0}")]
    Validation(String),
    #[error("transfer not found or expired")]
    NotFoundOrExpired,
    #[error("password required")]
    PasswordRequired,
    #[error("invalid password")]
    InvalidPassword,
    #[error("invalid PIN")]
    InvalidPin,
    #[error("transfer has already been used")]
    AlreadyUsed,
    #[error("invalid verification code")]
    InvalidVerificationCode,
    #[error("sender email `{0}` has not been verified")]
    SenderNotVerified(String),
    #[error("upload limit exceeded")]
    RateLimitExceeded(LimitCheck),
    #[error("upload `{0}` has no chunks")]
    NoChunks(String),
    #[error("stored file {0} decrypted to empty content")]
    EmptyContent(i64),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error("secret hashing failed: {0}")]
    Hashing(String),
}

impl TransferError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures caused by infrastructure rather than the caller.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::EmptyContent(_)
                | Self::Encryption(_)
                | Self::Storage(_)
                | Self::Kv(_)
                | Self::Database(_)
                | Self::Mail(_)
                | Self::Hashing(_)
        )
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
