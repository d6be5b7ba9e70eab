//! QR/PIN direct transfers between two devices.

use super::file::FileSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Clone, FromRow, Debug)]
pub struct DirectTransfer {
    pub id: i64,
    /// UUID carried in the QR payload.
    pub token: String,
    /// Argon2 PHC string of the six digit PIN.
    pub pin_hash: String,
    pub expires_at: DateTime<Utc>,
    /// Set once every file has been downloaded.
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

impl DirectTransfer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Returned to the sending device. The plaintext PIN exists only here.
#[derive(Serialize, Clone, Debug)]
pub struct DirectTransferTicket {
    #[serde(skip)]
    pub id: i64,
    pub token: String,
    pub pin: String,
    pub qr_data: String,
    pub expires_at: DateTime<Utc>,
}

/// A file of a direct transfer and whether it has been fetched.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DirectTransferFile {
    #[serde(flatten)]
    pub file: FileSummary,
    pub downloaded: bool,
}

#[derive(Serialize, Clone, Debug)]
pub struct DirectTransferListing {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub files: Vec<DirectTransferFile>,
}
