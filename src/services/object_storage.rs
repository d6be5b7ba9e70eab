//! src/services/object_storage.rs
//!
//! Object storage gateway for finalized (encrypted) uploads. Paths are opaque
//! keys such as `2025/01/31/file_<id>.encrypted`; callers never reuse a path.
//! `delete` is idempotent because cleanup paths call it speculatively.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object path `{0}`")]
    InvalidPath(String),
    #[error("remote storage request failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One object of a batch upload.
#[derive(Debug, Clone)]
pub struct ObjectUpload {
    pub path: String,
    pub content: Bytes,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `content` under `path`, returning the path.
    async fn upload(&self, content: Bytes, path: &str) -> StorageResult<String>;

    /// Upload every object concurrently. All uploads are allowed to settle;
    /// the first failure is then reported for the whole batch.
    async fn upload_batch(&self, files: Vec<ObjectUpload>) -> StorageResult<Vec<String>> {
        let uploads = files
            .into_iter()
            .map(|file| async move { self.upload(file.content, &file.path).await });
        join_all(uploads).await.into_iter().collect()
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes>;

    /// Remove `path`. Succeeds when the object does not exist.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Readiness check against the backing store.
    async fn probe(&self) -> StorageResult<()>;
}

/// Reject keys that could escape the storage root.
pub(crate) fn ensure_path_safe(path: &str) -> StorageResult<()> {
    let invalid = path.is_empty()
        || path.len() > MAX_OBJECT_KEY_LEN
        || path.starts_with('/')
        || path.contains("..")
        || path
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if invalid {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Objects stored as files beneath `base_path/{path}`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    base_path: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn object_path(&self, path: &str) -> StorageResult<PathBuf> {
        ensure_path_safe(path)?;
        Ok(self.base_path.join(path))
    }

    /// Write to a temp file, fsync, then rename into place so readers never
    /// observe a partially written object.
    async fn write_atomically(&self, target: &Path, content: &[u8]) -> StorageResult<()> {
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written: io::Result<()> = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(content).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, target).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    /// Remove empty directories from `start` up to (not including) the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(&self, content: Bytes, path: &str) -> StorageResult<String> {
        let target = self.object_path(path)?;
        self.write_atomically(&target, &content).await?;
        debug!("stored {} bytes at {}", content.len(), target.display());
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        let target = self.object_path(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let target = self.object_path(path)?;
        match fs::remove_file(&target).await {
            Ok(_) => debug!("removed object file {}", target.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object file {} already missing", target.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = target.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn probe(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let probe_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe_path, b"readyz").await?;
        let read_back = fs::read(&probe_path).await;
        let _ = fs::remove_file(&probe_path).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}
