//! Link and email transfers.

use super::file::FileSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TransferKind {
    Email,
    Link,
}

/// A shareable, time-limited grant over one or more stored files.
#[derive(Clone, FromRow, Debug)]
pub struct Transfer {
    pub id: i64,
    pub kind: TransferKind,
    pub message: Option<String>,

    /// Argon2 PHC string, absent for unprotected transfers.
    pub password_hash: Option<String>,

    pub sender_email: Option<String>,
    pub recipient_email: Option<String>,
    pub download_token: String,
    pub expires_at: DateTime<Utc>,
    pub single_download: bool,
    pub downloaded: bool,
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// A consumed single-use transfer never serves content again.
    pub fn is_consumed(&self) -> bool {
        self.single_download && self.downloaded
    }
}

/// Input for creating a transfer.
#[derive(Clone, Debug)]
pub struct NewTransfer {
    pub kind: TransferKind,
    pub file_ids: Vec<i64>,
    pub message: Option<String>,
    pub password: Option<String>,
    pub sender_email: Option<String>,
    pub recipient_email: Option<String>,
    /// 1, 2 or 3; defaults to 1.
    pub expires_in_days: Option<u32>,
    pub single_download: bool,
}

#[derive(Serialize, Clone, Debug)]
pub struct CreatedTransfer {
    pub id: i64,
    pub download_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Non-consuming view of a transfer.
#[derive(Serialize, Clone, Debug)]
pub struct TransferStatus {
    pub kind: TransferKind,
    pub message: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub password_protected: bool,
    pub single_download: bool,
    pub downloaded: bool,
    pub files: Vec<FileSummary>,
}
