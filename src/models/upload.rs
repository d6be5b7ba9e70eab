//! Chunked upload session shapes.

use serde::{Deserialize, Serialize};

/// Progress of an in-flight upload session.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    /// Percentage of declared chunks received, 0 to 100.
    pub current_progress: f64,
    pub total_chunks: u32,
}

/// Result of assembling a session into one stored object.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FinalizedUpload {
    pub path: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Keyring id the chunks were sealed with.
    pub encryption_key: String,
}

/// One entry of a batch finalize request.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpload {
    pub upload_id: String,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
}
