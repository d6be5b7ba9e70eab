//! src/services/chunk_store.rs
//!
//! Upload sessions: chunks are sealed as they arrive and parked in the KV
//! store under `upload:{id}:chunks`, with progress under
//! `upload:{id}:progress`. Both keys share a TTL refreshed on every write so
//! an active session never expires while an abandoned one disappears.
//!
//! Finalize sorts chunks by index, frames them into one object and uploads
//! it. The target path is registered in `uploads:pending` before the upload
//! and forgotten only on success, so a crash leaves a discoverable orphan.

use super::{
    encryption::{Keyring, NONCE_LEN, TAG_LEN, join_frames},
    error::{TransferError, TransferResult},
    kv::KvStore,
    object_storage::{ObjectStorage, ObjectUpload},
};
use crate::models::upload::{BatchUpload, FinalizedUpload, UploadProgress};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const PENDING_UPLOADS_KEY: &str = "uploads:pending";
const FINALIZE_BATCH_SIZE: usize = 2;
const MAX_UPLOAD_ID_LEN: usize = 128;
const CHUNK_FIELD_PREFIX: &str = "chunk:";

fn chunks_key(upload_id: &str) -> String {
    format!("upload:{upload_id}:chunks")
}

fn progress_key(upload_id: &str) -> String {
    format!("upload:{upload_id}:progress")
}

/// Date-partitioned, collision-free object key for a finalized upload.
pub fn storage_path(now: DateTime<Utc>) -> String {
    format!(
        "{}/file_{}.encrypted",
        now.format("%Y/%m/%d"),
        Uuid::new_v4().simple()
    )
}

/// Upload ids end up inside KV keys, so only a conservative alphabet passes.
fn ensure_upload_id(upload_id: &str) -> TransferResult<()> {
    let valid = !upload_id.is_empty()
        && upload_id.len() <= MAX_UPLOAD_ID_LEN
        && upload_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if !valid {
        return Err(TransferError::validation("invalid upload id"));
    }
    Ok(())
}

/// A loaded session: sealed chunks in index order.
struct SessionChunks {
    sealed: Vec<Bytes>,
    plaintext_len: u64,
}

#[derive(Clone)]
pub struct ChunkStore {
    kv: Arc<dyn KvStore>,
    storage: Arc<dyn ObjectStorage>,
    keyring: Keyring,
    chunk_ttl: Duration,
}

impl ChunkStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        storage: Arc<dyn ObjectStorage>,
        keyring: Keyring,
        chunk_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            storage,
            keyring,
            chunk_ttl,
        }
    }

    pub fn chunk_ttl(&self) -> Duration {
        self.chunk_ttl
    }

    /// Seal and store one chunk. Re-sending an index overwrites it. The
    /// declared total is fixed by the first chunk; a different value later is
    /// rejected.
    pub async fn store_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        chunk: &[u8],
        total_chunks: u32,
    ) -> TransferResult<UploadProgress> {
        ensure_upload_id(upload_id)?;
        if total_chunks == 0 {
            return Err(TransferError::validation("totalChunks must be at least 1"));
        }
        if chunk_index >= total_chunks {
            return Err(TransferError::validation(format!(
                "chunk {chunk_index} is out of range for {total_chunks} chunks"
            )));
        }

        let progress_key = progress_key(upload_id);
        if let Some(declared) = self.declared_total(&progress_key).await? {
            if declared != total_chunks {
                return Err(TransferError::validation(format!(
                    "totalChunks changed from {declared} to {total_chunks}"
                )));
            }
        }

        let sealed = self.keyring.seal_chunk(chunk)?;
        let chunks_key = chunks_key(upload_id);
        self.kv
            .hash_set(
                &chunks_key,
                vec![(
                    format!("{CHUNK_FIELD_PREFIX}{chunk_index}"),
                    Bytes::from(sealed),
                )],
                Some(self.chunk_ttl),
            )
            .await?;

        let received = self.kv.hash_len(&chunks_key).await?;
        let progress = UploadProgress {
            current_progress: (received as f64 / total_chunks as f64 * 100.0).min(100.0),
            total_chunks,
        };
        self.kv
            .hash_set(
                &progress_key,
                vec![
                    ("total_chunks".into(), Bytes::from(total_chunks.to_string())),
                    (
                        "progress".into(),
                        Bytes::from(progress.current_progress.to_string()),
                    ),
                    (
                        "updated_at".into(),
                        Bytes::from(Utc::now().timestamp().to_string()),
                    ),
                ],
                Some(self.chunk_ttl),
            )
            .await?;

        debug!(
            "stored chunk {}/{} for upload {} ({} bytes)",
            chunk_index + 1,
            total_chunks,
            upload_id,
            chunk.len()
        );
        Ok(progress)
    }

    async fn declared_total(&self, progress_key: &str) -> TransferResult<Option<u32>> {
        let raw = self.kv.hash_get(progress_key, "total_chunks").await?;
        Ok(raw.and_then(|value| std::str::from_utf8(&value).ok()?.parse().ok()))
    }

    /// Read-only progress lookup. Unknown sessions and store failures both
    /// report zeroes.
    pub async fn get_upload_progress(&self, upload_id: &str) -> UploadProgress {
        if ensure_upload_id(upload_id).is_err() {
            return UploadProgress::default();
        }
        let fields = match self.kv.hash_get_all(&progress_key(upload_id)).await {
            Ok(fields) => fields,
            Err(err) => {
                warn!("failed to read progress for upload {}: {}", upload_id, err);
                return UploadProgress::default();
            }
        };

        let field = |name: &str| {
            fields
                .get(name)
                .and_then(|value| std::str::from_utf8(value).ok().map(str::to_owned))
        };
        UploadProgress {
            current_progress: field("progress")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            total_chunks: field("total_chunks")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    /// Remove all state for a session. A missing session is not an error.
    pub async fn delete_chunks(&self, upload_id: &str) -> TransferResult<()> {
        ensure_upload_id(upload_id)?;
        self.kv
            .delete(&[chunks_key(upload_id), progress_key(upload_id)])
            .await?;
        Ok(())
    }

    /// Load every chunk of a complete session in index order.
    async fn load_chunks(&self, upload_id: &str) -> TransferResult<SessionChunks> {
        let stored = self.kv.hash_get_all(&chunks_key(upload_id)).await?;
        if stored.is_empty() {
            return Err(TransferError::NoChunks(upload_id.to_string()));
        }

        let mut indexed = Vec::with_capacity(stored.len());
        for (field, sealed) in stored {
            let index = field
                .strip_prefix(CHUNK_FIELD_PREFIX)
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| {
                    TransferError::validation(format!("unexpected chunk field `{field}`"))
                })?;
            indexed.push((index, sealed));
        }
        indexed.sort_unstable_by_key(|(index, _)| *index);

        let total = self
            .declared_total(&progress_key(upload_id))
            .await?
            .unwrap_or(indexed.len() as u32);
        let complete = indexed.len() == total as usize
            && indexed
                .iter()
                .enumerate()
                .all(|(position, (index, _))| *index as usize == position);
        if !complete {
            return Err(TransferError::validation(format!(
                "upload {upload_id} is incomplete: received {} of {total} chunks",
                indexed.len()
            )));
        }

        let plaintext_len = indexed
            .iter()
            .map(|(_, sealed)| sealed.len().saturating_sub(NONCE_LEN + TAG_LEN) as u64)
            .sum();
        Ok(SessionChunks {
            sealed: indexed.into_iter().map(|(_, sealed)| sealed).collect(),
            plaintext_len,
        })
    }

    async fn register_pending(&self, paths: &[String]) -> TransferResult<()> {
        let now = Bytes::from(Utc::now().timestamp().to_string());
        let fields = paths
            .iter()
            .map(|path| (path.clone(), now.clone()))
            .collect();
        self.kv.hash_set(PENDING_UPLOADS_KEY, fields, None).await?;
        Ok(())
    }

    /// Drop a path from the pending set once its object is accounted for.
    pub async fn forget_pending(&self, path: &str) -> TransferResult<()> {
        self.kv.hash_delete(PENDING_UPLOADS_KEY, path).await?;
        Ok(())
    }

    /// Remove a possibly partial remote object. Its pending entry is kept
    /// when removal fails so a later sweep retries it.
    async fn discard_remote(&self, path: &str) {
        match self.storage.delete(path).await {
            Ok(()) => {
                if let Err(err) = self.forget_pending(path).await {
                    warn!("failed to forget pending upload {}: {}", path, err);
                }
            }
            Err(err) => warn!("failed to remove partial upload {}: {}", path, err),
        }
    }

    /// Assemble a complete session into one stored object. Session state is
    /// purged whatever the outcome.
    pub async fn finalize_upload(&self, upload_id: &str) -> TransferResult<FinalizedUpload> {
        ensure_upload_id(upload_id)?;
        let result = self.assemble_and_upload(upload_id).await;
        if let Err(err) = self.delete_chunks(upload_id).await {
            warn!("failed to purge chunks for upload {}: {}", upload_id, err);
        }
        if let Err(err) = &result {
            error!("finalize failed for upload {}: {}", upload_id, err);
        }
        result
    }

    async fn assemble_and_upload(&self, upload_id: &str) -> TransferResult<FinalizedUpload> {
        let session = self.load_chunks(upload_id).await?;
        let object = join_frames(&session.sealed)?;
        let path = storage_path(Utc::now());

        self.register_pending(std::slice::from_ref(&path)).await?;
        if let Err(err) = self.storage.upload(object, &path).await {
            self.discard_remote(&path).await;
            return Err(err.into());
        }
        if let Err(err) = self.forget_pending(&path).await {
            warn!("failed to forget pending upload {}: {}", path, err);
        }

        Ok(FinalizedUpload {
            path,
            size: session.plaintext_len,
            encryption_key: self.keyring.current_id().to_string(),
        })
    }

    /// Finalize several sessions, at most two at a time. On any failure every
    /// session of the request is purged and objects already uploaded by
    /// earlier batches are removed.
    pub async fn finalize_batch(
        &self,
        uploads: &[BatchUpload],
    ) -> TransferResult<Vec<FinalizedUpload>> {
        if uploads.is_empty() {
            return Err(TransferError::validation("uploads must not be empty"));
        }
        for upload in uploads {
            ensure_upload_id(&upload.upload_id)?;
        }

        let mut finalized = Vec::with_capacity(uploads.len());
        let result = self.finalize_batches(uploads, &mut finalized).await;
        if let Err(err) = &result {
            error!("batch finalize failed: {}", err);
            join_all(
                uploads
                    .iter()
                    .map(|upload| self.delete_chunks(&upload.upload_id)),
            )
            .await;
            join_all(finalized.iter().map(|done| self.discard_remote(&done.path))).await;
        }
        result.map(|()| finalized)
    }

    async fn finalize_batches(
        &self,
        uploads: &[BatchUpload],
        finalized: &mut Vec<FinalizedUpload>,
    ) -> TransferResult<()> {
        for batch in uploads.chunks(FINALIZE_BATCH_SIZE) {
            let sessions = try_join_all(
                batch
                    .iter()
                    .map(|upload| self.load_chunks(&upload.upload_id)),
            )
            .await?;

            let now = Utc::now();
            let mut objects = Vec::with_capacity(sessions.len());
            let mut results = Vec::with_capacity(sessions.len());
            for session in sessions {
                let path = storage_path(now);
                objects.push(ObjectUpload {
                    path: path.clone(),
                    content: join_frames(&session.sealed)?,
                });
                results.push(FinalizedUpload {
                    path,
                    size: session.plaintext_len,
                    encryption_key: self.keyring.current_id().to_string(),
                });
            }

            let paths: Vec<String> = results.iter().map(|done| done.path.clone()).collect();
            self.register_pending(&paths).await?;
            if let Err(err) = self.storage.upload_batch(objects).await {
                join_all(paths.iter().map(|path| self.discard_remote(path))).await;
                return Err(err.into());
            }

            for path in &paths {
                if let Err(err) = self.forget_pending(path).await {
                    warn!("failed to forget pending upload {}: {}", path, err);
                }
            }
            try_join_all(
                batch
                    .iter()
                    .map(|upload| self.delete_chunks(&upload.upload_id)),
            )
            .await?;
            finalized.extend(results);
        }
        Ok(())
    }

    /// Pending paths registered more than `max_age` ago.
    pub async fn stale_pending_uploads(&self, max_age: Duration) -> TransferResult<Vec<String>> {
        let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;
        let pending = self.kv.hash_get_all(PENDING_UPLOADS_KEY).await?;
        let mut stale: Vec<String> = pending
            .into_iter()
            .filter(|(_, registered)| {
                std::str::from_utf8(registered)
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok())
                    .is_none_or(|at| at <= cutoff)
            })
            .map(|(path, _)| path)
            .collect();
        stale.sort();
        Ok(stale)
    }

    /// Drop session keys that lost their TTL. Returns how many were removed.
    pub async fn purge_untracked_sessions(&self) -> TransferResult<u64> {
        Ok(self.kv.delete_persistent("upload:*").await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{encryption::EncryptionError, kv::MemoryKv, kv::Ttl},
        test_support::{FlakyStorage, test_keyring},
    };
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        kv: Arc<MemoryKv>,
        storage: Arc<FlakyStorage>,
        store: ChunkStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(MemoryKv::new());
        let storage = Arc::new(FlakyStorage::new(dir.path()));
        let store = ChunkStore::new(
            kv.clone(),
            storage.clone(),
            test_keyring(),
            Duration::from_secs(3600),
        );
        Fixture {
            _dir: dir,
            kv,
            storage,
            store,
        }
    }

    async fn read_back(fx: &Fixture, done: &FinalizedUpload) -> Vec<u8> {
        let object = fx.storage.get(&done.path).await.unwrap();
        test_keyring()
            .open_object(&done.encryption_key, &object)
            .unwrap()
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble_in_index_order() {
        let fx = fixture();
        let parts = [b"0000000000", b"1111111111", b"2222222222"];
        for index in [2u32, 0, 1] {
            fx.store
                .store_chunk("up-1", index, parts[index as usize], 3)
                .await
                .unwrap();
        }

        let done = fx.store.finalize_upload("up-1").await.unwrap();
        assert_eq!(done.size, 30);
        assert_eq!(done.encryption_key, "test");
        assert!(done.path.ends_with(".encrypted"));
        assert!(done.path.contains("/file_"));
        assert_eq!(read_back(&fx, &done).await, b"000000000011111111112222222222");

        assert_eq!(
            fx.store.get_upload_progress("up-1").await,
            UploadProgress::default()
        );
        assert!(fx.kv.keys("upload:*").await.unwrap().is_empty());
        assert!(
            fx.kv
                .hash_get_all(PENDING_UPLOADS_KEY)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn chunks_are_sealed_before_they_reach_the_store() {
        let fx = fixture();
        fx.store
            .store_chunk("sealed", 0, b"plain text", 1)
            .await
            .unwrap();
        let stored = fx
            .kv
            .hash_get("upload:sealed:chunks", "chunk:0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.len(), NONCE_LEN + 10 + TAG_LEN);
        assert!(!stored.windows(10).any(|w| w == b"plain text"));
    }

    #[tokio::test]
    async fn progress_tracks_received_chunks() {
        let fx = fixture();
        let progress = fx.store.store_chunk("p", 0, b"a", 4).await.unwrap();
        assert_eq!(progress.current_progress, 25.0);

        fx.store.store_chunk("p", 3, b"d", 4).await.unwrap();
        // Re-sending an index overwrites instead of counting twice.
        fx.store.store_chunk("p", 3, b"d", 4).await.unwrap();

        let progress = fx.store.get_upload_progress("p").await;
        assert_eq!(progress.current_progress, 50.0);
        assert_eq!(progress.total_chunks, 4);
    }

    #[tokio::test]
    async fn unknown_sessions_report_zero_progress() {
        let fx = fixture();
        assert_eq!(
            fx.store.get_upload_progress("nobody").await,
            UploadProgress::default()
        );
        assert_eq!(
            fx.store.get_upload_progress("bad id*").await,
            UploadProgress::default()
        );
    }

    #[tokio::test]
    async fn rejects_out_of_range_and_changed_totals() {
        let fx = fixture();
        for (index, total) in [(0u32, 0u32), (3, 3), (7, 2)] {
            assert!(matches!(
                fx.store.store_chunk("v", index, b"x", total).await,
                Err(TransferError::Validation(_))
            ));
        }

        fx.store.store_chunk("v", 0, b"x", 2).await.unwrap();
        assert!(matches!(
            fx.store.store_chunk("v", 1, b"y", 3).await,
            Err(TransferError::Validation(_))
        ));
        assert!(matches!(
            fx.store.store_chunk("a*b", 0, b"x", 1).await,
            Err(TransferError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn session_ttl_is_refreshed_per_chunk() {
        let fx = fixture();
        fx.store.store_chunk("ttl", 0, b"x", 2).await.unwrap();
        for key in ["upload:ttl:chunks", "upload:ttl:progress"] {
            assert!(matches!(fx.kv.ttl(key).await.unwrap(), Ttl::Expires(_)));
        }
    }

    #[tokio::test]
    async fn finalize_without_chunks_fails() {
        let fx = fixture();
        assert!(matches!(
            fx.store.finalize_upload("empty").await,
            Err(TransferError::NoChunks(id)) if id == "empty"
        ));
    }

    #[tokio::test]
    async fn incomplete_sessions_are_rejected_and_purged() {
        let fx = fixture();
        fx.store.store_chunk("gap", 0, b"a", 3).await.unwrap();
        fx.store.store_chunk("gap", 2, b"c", 3).await.unwrap();

        assert!(matches!(
            fx.store.finalize_upload("gap").await,
            Err(TransferError::Validation(_))
        ));
        assert!(fx.kv.keys("upload:gap:*").await.unwrap().is_empty());
        assert!(fx.storage.deleted().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_purges_session_and_removes_partial_object() {
        let fx = fixture();
        fx.store.store_chunk("boom", 0, b"a", 1).await.unwrap();
        fx.storage.fail_uploads(true);

        assert!(matches!(
            fx.store.finalize_upload("boom").await,
            Err(TransferError::Storage(_))
        ));
        assert!(fx.kv.keys("upload:boom:*").await.unwrap().is_empty());
        assert_eq!(fx.storage.deleted().len(), 1);
        assert!(
            fx.kv
                .hash_get_all(PENDING_UPLOADS_KEY)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn pending_entry_survives_when_partial_object_cannot_be_removed() {
        let fx = fixture();
        fx.store.store_chunk("stuck", 0, b"a", 1).await.unwrap();
        fx.storage.fail_uploads(true);
        fx.storage.fail_deletes(true);

        assert!(fx.store.finalize_upload("stuck").await.is_err());
        let stale = fx
            .store
            .stale_pending_uploads(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stale, fx.storage.deleted());
        assert!(
            fx.store
                .stale_pending_uploads(Duration::from_secs(3600))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn finalize_fails_with_unknown_key_material() {
        let fx = fixture();
        fx.store.store_chunk("k", 0, b"a", 1).await.unwrap();
        let done = fx.store.finalize_upload("k").await.unwrap();
        let object = fx.storage.get(&done.path).await.unwrap();
        assert!(matches!(
            test_keyring().open_object("rotated-away", &object),
            Err(EncryptionError::UnknownKey(_))
        ));
    }

    fn batch_entry(id: &str, size: u64) -> BatchUpload {
        BatchUpload {
            upload_id: id.into(),
            filename: format!("{id}.txt"),
            mime_type: "text/plain".into(),
            total_size: size,
        }
    }

    #[tokio::test]
    async fn batch_finalize_processes_every_session_in_order() {
        let fx = fixture();
        let uploads: Vec<BatchUpload> = (0..5).map(|n| batch_entry(&format!("b{n}"), 2)).collect();
        for (n, upload) in uploads.iter().enumerate() {
            fx.store
                .store_chunk(&upload.upload_id, 1, format!("{n}b").as_bytes(), 2)
                .await
                .unwrap();
            fx.store
                .store_chunk(&upload.upload_id, 0, format!("{n}a").as_bytes(), 2)
                .await
                .unwrap();
        }

        let done = fx.store.finalize_batch(&uploads).await.unwrap();
        assert_eq!(done.len(), 5);
        for (n, finalized) in done.iter().enumerate() {
            assert_eq!(
                read_back(&fx, finalized).await,
                format!("{n}a{n}b").into_bytes()
            );
        }
        assert!(fx.kv.keys("upload:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_failure_purges_every_session_and_earlier_objects() {
        let fx = fixture();
        let uploads = vec![
            batch_entry("ok-1", 1),
            batch_entry("ok-2", 1),
            batch_entry("missing", 1),
            batch_entry("ok-3", 1),
        ];
        for id in ["ok-1", "ok-2", "ok-3"] {
            fx.store.store_chunk(id, 0, b"x", 1).await.unwrap();
        }

        assert!(matches!(
            fx.store.finalize_batch(&uploads).await,
            Err(TransferError::NoChunks(id)) if id == "missing"
        ));
        assert!(fx.kv.keys("upload:*").await.unwrap().is_empty());

        // The first batch had already been uploaded and is rolled back.
        let removed = fx.storage.deleted();
        assert_eq!(removed.len(), 2);
        for path in removed {
            assert!(!fx.storage.exists(&path).await);
        }
    }

    #[tokio::test]
    async fn delete_chunks_is_a_noop_for_unknown_sessions() {
        let fx = fixture();
        fx.store.delete_chunks("ghost").await.unwrap();
        fx.store.store_chunk("real", 0, b"x", 2).await.unwrap();
        fx.store.delete_chunks("real").await.unwrap();
        assert!(fx.kv.keys("upload:real:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn untracked_sessions_are_purged() {
        let fx = fixture();
        fx.store.store_chunk("live", 0, b"x", 2).await.unwrap();
        fx.store.store_chunk("lost", 0, b"x", 2).await.unwrap();
        fx.kv.persist("upload:lost:chunks").await;

        assert_eq!(fx.store.purge_untracked_sessions().await.unwrap(), 1);
        assert_eq!(
            fx.kv.keys("upload:*:chunks").await.unwrap(),
            vec!["upload:live:chunks"]
        );
    }
}
