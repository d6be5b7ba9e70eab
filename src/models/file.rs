//! A finalized, encrypted file held in object storage.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Metadata for one stored object. The bytes live in object storage.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct StoredFile {
    pub id: i64,

    /// Filename supplied by the uploader.
    pub original_name: String,

    /// Opaque object storage key, e.g. `2025/01/31/file_<id>.encrypted`.
    pub storage_path: String,

    /// Plaintext size in bytes.
    pub size: i64,

    pub mime_type: String,

    /// Identifier of the keyring entry the object was sealed with. Never the
    /// key material itself.
    #[serde(skip)]
    pub encryption_key: String,

    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
}

/// Public view of a stored file.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FileSummary {
    pub id: i64,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
}

impl From<&StoredFile> for FileSummary {
    fn from(file: &StoredFile) -> Self {
        Self {
            id: file.id,
            name: file.original_name.clone(),
            size: file.size,
            mime_type: file.mime_type.clone(),
        }
    }
}

/// Destructive cleanup owed once a download response has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeTarget {
    Transfer(i64),
    DirectTransfer(i64),
}

/// Decrypted file content ready to be returned to a client.
#[derive(Debug)]
pub struct Download {
    pub file: StoredFile,
    pub content: Vec<u8>,
    /// Set when this download consumed the grant.
    pub purge: Option<PurgeTarget>,
}
