//! src/services/cleanup.rs
//!
//! Periodic sweep reconciling expired, used and orphaned state across the
//! database, the KV store and object storage.
//!
//! Every item is cleaned up on its own: a failure is logged, counted and
//! skipped, and the item is retried on the next run. Purges delete remote
//! objects before rows, so an interrupted run leaves rows to retry from.

use super::{
    chunk_store::ChunkStore,
    direct_transfer_service::DirectTransferService,
    error::TransferResult,
    file_service::FileService,
    object_storage::ObjectStorage,
    rate_limit::RateLimiter,
    transfer_service::TransferService,
};
use chrono::Utc;
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{info, warn};

/// What one run removed, and how many items failed.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_transfers: u64,
    pub consumed_transfers: u64,
    pub expired_direct_transfers: u64,
    pub used_direct_transfers: u64,
    pub stale_uploads: u64,
    pub untracked_sessions: u64,
    pub rate_limit_records: u64,
    pub orphaned_files: u64,
    pub failures: u64,
}

impl CleanupReport {
    pub fn removed(&self) -> u64 {
        self.expired_transfers
            + self.consumed_transfers
            + self.expired_direct_transfers
            + self.used_direct_transfers
            + self.stale_uploads
            + self.untracked_sessions
            + self.rate_limit_records
            + self.orphaned_files
    }
}

#[derive(Clone)]
pub struct CleanupScheduler {
    transfers: TransferService,
    direct: DirectTransferService,
    chunks: ChunkStore,
    files: FileService,
    limiter: RateLimiter,
    storage: Arc<dyn ObjectStorage>,
    interval: Duration,
}

impl CleanupScheduler {
    pub fn new(
        transfers: TransferService,
        direct: DirectTransferService,
        chunks: ChunkStore,
        files: FileService,
        limiter: RateLimiter,
        storage: Arc<dyn ObjectStorage>,
        interval: Duration,
    ) -> Self {
        Self {
            transfers,
            direct,
            chunks,
            files,
            limiter,
            storage,
            interval,
        }
    }

    /// Sweep on every tick until shutdown. The first sweep runs immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("cleanup scheduler running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("cleanup scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    pub async fn run_once(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let now = Utc::now();

        report.expired_transfers = purge_each(
            "expired transfer",
            self.transfers.expired_ids(now).await,
            |id| self.transfers.purge_transfer(id),
            &mut report.failures,
        )
        .await;
        report.consumed_transfers = purge_each(
            "consumed transfer",
            self.transfers.consumed_ids().await,
            |id| self.transfers.purge_transfer(id),
            &mut report.failures,
        )
        .await;
        report.expired_direct_transfers = purge_each(
            "expired direct transfer",
            self.direct.expired_ids(now).await,
            |id| self.direct.purge(id),
            &mut report.failures,
        )
        .await;
        report.used_direct_transfers = purge_each(
            "used direct transfer",
            self.direct.used_ids().await,
            |id| self.direct.purge(id),
            &mut report.failures,
        )
        .await;

        report.stale_uploads = self.sweep_stale_uploads(&mut report.failures).await;
        report.untracked_sessions = counted(
            "untracked upload sessions",
            self.chunks.purge_untracked_sessions().await,
            &mut report.failures,
        );
        report.rate_limit_records = counted(
            "orphaned rate-limit records",
            self.limiter.clean_orphaned_records().await,
            &mut report.failures,
        );
        report.orphaned_files = self.sweep_orphaned_files(&mut report.failures).await;

        if report.removed() > 0 || report.failures > 0 {
            info!(
                expired_transfers = report.expired_transfers,
                consumed_transfers = report.consumed_transfers,
                expired_direct_transfers = report.expired_direct_transfers,
                used_direct_transfers = report.used_direct_transfers,
                stale_uploads = report.stale_uploads,
                untracked_sessions = report.untracked_sessions,
                rate_limit_records = report.rate_limit_records,
                orphaned_files = report.orphaned_files,
                failures = report.failures,
                "cleanup run finished"
            );
        } else {
            info!("cleanup run finished, nothing to do");
        }
        report
    }

    /// Objects registered before an upload but never recorded or discarded.
    /// A path that did end up recorded only loses its pending entry.
    async fn sweep_stale_uploads(&self, failures: &mut u64) -> u64 {
        let stale = match self
            .chunks
            .stale_pending_uploads(self.chunks.chunk_ttl())
            .await
        {
            Ok(stale) => stale,
            Err(err) => {
                warn!("failed to list stale uploads: {}", err);
                *failures += 1;
                return 0;
            }
        };

        let mut removed = 0;
        for path in stale {
            match self.discard_stale_upload(&path).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!("failed to clean up stale upload {}: {}", path, err);
                    *failures += 1;
                }
            }
        }
        removed
    }

    async fn discard_stale_upload(&self, path: &str) -> TransferResult<()> {
        if !self.files.is_recorded(path).await? {
            self.storage.delete(path).await?;
        }
        self.chunks.forget_pending(path).await
    }

    async fn sweep_orphaned_files(&self, failures: &mut u64) -> u64 {
        let orphans = match self.files.orphaned_files(Utc::now()).await {
            Ok(orphans) => orphans,
            Err(err) => {
                warn!("failed to list orphaned files: {}", err);
                *failures += 1;
                return 0;
            }
        };

        let mut removed = 0;
        for file in &orphans {
            match self.files.purge_file(file).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!("failed to purge orphaned file {}: {}", file.id, err);
                    *failures += 1;
                }
            }
        }
        removed
    }
}

async fn purge_each<F, Fut>(
    what: &str,
    ids: TransferResult<Vec<i64>>,
    purge: F,
    failures: &mut u64,
) -> u64
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = TransferResult<()>>,
{
    let ids = match ids {
        Ok(ids) => ids,
        Err(err) => {
            warn!("failed to list {}s: {}", what, err);
            *failures += 1;
            return 0;
        }
    };

    let mut purged = 0;
    for id in ids {
        match purge(id).await {
            Ok(()) => purged += 1,
            Err(err) => {
                warn!("failed to purge {} {}: {}", what, id, err);
                *failures += 1;
            }
        }
    }
    purged
}

fn counted(what: &str, result: TransferResult<u64>, failures: &mut u64) -> u64 {
    result.unwrap_or_else(|err| {
        warn!("failed to remove {}: {}", what, err);
        *failures += 1;
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::test_pool,
        models::{
            file::StoredFile,
            transfer::{NewTransfer, TransferKind},
            upload::FinalizedUpload,
        },
        services::{
            chunk_store::PENDING_UPLOADS_KEY,
            encryption::join_frames,
            kv::{KvStore, MemoryKv},
            notification::NotificationQueue,
            secrets::cheap_hasher,
        },
        test_support::{FlakyStorage, test_keyring},
    };
    use bytes::Bytes;
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: SqlitePool,
        kv: Arc<MemoryKv>,
        storage: Arc<FlakyStorage>,
        files: FileService,
        transfers: TransferService,
        direct: DirectTransferService,
        limiter: RateLimiter,
        scheduler: CleanupScheduler,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = test_pool().await;
        let kv = Arc::new(MemoryKv::new());
        let storage = Arc::new(FlakyStorage::new(dir.path()));
        let files = FileService::new(
            db.clone(),
            storage.clone(),
            test_keyring(),
            chrono::Duration::days(3),
        );
        let (queue, _outbox) = NotificationQueue::new();
        let transfers = TransferService::new(db.clone(), files.clone(), cheap_hasher(), queue);
        let direct = DirectTransferService::new(
            db.clone(),
            files.clone(),
            cheap_hasher(),
            "https://share.example.com",
            chrono::Duration::minutes(60),
        );
        let chunks = ChunkStore::new(
            kv.clone(),
            storage.clone(),
            test_keyring(),
            Duration::from_secs(3600),
        );
        let limiter = RateLimiter::new(kv.clone(), 1 << 30, Duration::from_secs(86_400));
        let scheduler = CleanupScheduler::new(
            transfers.clone(),
            direct.clone(),
            chunks,
            files.clone(),
            limiter.clone(),
            storage.clone(),
            Duration::from_secs(60),
        );
        Fixture {
            _dir: dir,
            db,
            kv,
            storage,
            files,
            transfers,
            direct,
            limiter,
            scheduler,
        }
    }

    async fn stored_file(fx: &Fixture, name: &str) -> StoredFile {
        let path = format!("c/{name}.encrypted");
        let sealed = test_keyring().seal_chunk(name.as_bytes()).unwrap();
        fx.storage
            .upload(join_frames(&[sealed]).unwrap(), &path)
            .await
            .unwrap();
        let upload = FinalizedUpload {
            path,
            size: name.len() as u64,
            encryption_key: "test".into(),
        };
        fx.files
            .record_upload(&upload, name, "text/plain")
            .await
            .unwrap()
    }

    fn link(file_ids: Vec<i64>, single_download: bool) -> NewTransfer {
        NewTransfer {
            kind: TransferKind::Link,
            file_ids,
            message: None,
            password: None,
            sender_email: None,
            recipient_email: None,
            expires_in_days: None,
            single_download,
        }
    }

    async fn expire(db: &SqlitePool, table: &str, id: i64) {
        sqlx::query(&format!("UPDATE {table} SET expires_at = ? WHERE id = ?"))
            .bind(Utc::now() - chrono::Duration::seconds(5))
            .bind(id)
            .execute(db)
            .await
            .unwrap();
    }

    async fn register_pending(kv: &MemoryKv, path: &str, registered_at: i64) {
        kv.hash_set(
            PENDING_UPLOADS_KEY,
            vec![(path.to_string(), Bytes::from(registered_at.to_string()))],
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn sweeps_every_kind_of_dead_state_and_is_idempotent() {
        let fx = fixture().await;

        let live_file = stored_file(&fx, "live").await;
        let live = fx
            .transfers
            .create(link(vec![live_file.id], false))
            .await
            .unwrap();

        let expired_file = stored_file(&fx, "expired").await;
        let expired = fx
            .transfers
            .create(link(vec![expired_file.id], false))
            .await
            .unwrap();
        expire(&fx.db, "transfers", expired.id).await;

        let consumed_file = stored_file(&fx, "consumed").await;
        let consumed = fx
            .transfers
            .create(link(vec![consumed_file.id], true))
            .await
            .unwrap();
        fx.transfers
            .download(&consumed.download_token, None, None)
            .await
            .unwrap();

        let direct_file = stored_file(&fx, "direct").await;
        let ticket = fx.direct.generate(&[direct_file.id]).await.unwrap();
        expire(&fx.db, "direct_transfers", ticket.id).await;

        let used_file = stored_file(&fx, "used").await;
        let used = fx.direct.generate(&[used_file.id]).await.unwrap();
        fx.direct
            .download(&used.token, &used.pin, used_file.id)
            .await
            .unwrap();

        let orphan = stored_file(&fx, "orphan").await;
        expire(&fx.db, "files", orphan.id).await;

        let stale_path = "2025/01/01/file_stale.encrypted";
        fx.storage
            .upload(Bytes::from_static(b"partial"), stale_path)
            .await
            .unwrap();
        register_pending(&fx.kv, stale_path, Utc::now().timestamp() - 7200).await;
        register_pending(&fx.kv, "2025/01/01/file_fresh.encrypted", Utc::now().timestamp()).await;

        fx.limiter.track_usage("10.0.0.9", 100).await.unwrap();
        fx.kv.persist("upload_limit:10.0.0.9").await;
        fx.kv
            .hash_set(
                "upload:lost:chunks",
                vec![("chunk:0".into(), Bytes::from_static(b"x"))],
                None,
            )
            .await
            .unwrap();

        let report = fx.scheduler.run_once().await;
        assert_eq!(
            report,
            CleanupReport {
                expired_transfers: 1,
                consumed_transfers: 1,
                expired_direct_transfers: 1,
                used_direct_transfers: 1,
                stale_uploads: 1,
                untracked_sessions: 1,
                rate_limit_records: 1,
                orphaned_files: 1,
                failures: 0,
            }
        );

        for gone in [&expired_file, &consumed_file, &direct_file, &used_file, &orphan] {
            assert!(!fx.storage.exists(&gone.storage_path).await);
            assert!(fx.files.find(gone.id).await.unwrap().is_none());
        }
        assert!(!fx.storage.exists(stale_path).await);
        assert!(fx.storage.exists(&live_file.storage_path).await);
        assert!(fx.transfers.check_transfer(&live.download_token).await.is_ok());
        let pending = fx.kv.hash_get_all(PENDING_UPLOADS_KEY).await.unwrap();
        assert_eq!(pending.len(), 1);

        let deletes_before = fx.storage.deleted().len();
        let second = fx.scheduler.run_once().await;
        assert_eq!(second, CleanupReport::default());
        assert_eq!(fx.storage.deleted().len(), deletes_before);
    }

    #[tokio::test]
    async fn one_failing_item_does_not_stop_the_sweep() {
        let fx = fixture().await;
        let a = stored_file(&fx, "a").await;
        let b = stored_file(&fx, "b").await;
        let first = fx.transfers.create(link(vec![a.id], false)).await.unwrap();
        let second = fx.transfers.create(link(vec![b.id], false)).await.unwrap();
        expire(&fx.db, "transfers", first.id).await;
        expire(&fx.db, "transfers", second.id).await;

        fx.storage.fail_deletes(true);
        let report = fx.scheduler.run_once().await;
        assert_eq!(report.expired_transfers, 0);
        assert_eq!(report.failures, 2);
        assert!(fx.files.find(a.id).await.unwrap().is_some());

        fx.storage.fail_deletes(false);
        let report = fx.scheduler.run_once().await;
        assert_eq!(report.expired_transfers, 2);
        assert_eq!(report.failures, 0);
        assert!(fx.transfers.expired_ids(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recorded_pending_paths_are_only_forgotten() {
        let fx = fixture().await;
        let file = stored_file(&fx, "kept").await;
        register_pending(&fx.kv, &file.storage_path, 0).await;

        let report = fx.scheduler.run_once().await;
        assert_eq!(report.stale_uploads, 1);
        assert!(fx.storage.exists(&file.storage_path).await);
        assert!(
            fx.kv
                .hash_get_all(PENDING_UPLOADS_KEY)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn referenced_expired_files_wait_for_their_transfer() {
        let fx = fixture().await;
        let file = stored_file(&fx, "shared").await;
        let transfer = fx.transfers.create(link(vec![file.id], false)).await.unwrap();
        expire(&fx.db, "files", file.id).await;

        let report = fx.scheduler.run_once().await;
        assert_eq!(report.orphaned_files, 0);
        assert!(fx.transfers.check_transfer(&transfer.download_token).await.is_ok());
        assert!(fx.storage.exists(&file.storage_path).await);
    }

    #[tokio::test]
    async fn sweep_spares_a_single_use_download_in_flight() {
        let fx = fixture().await;
        let file = stored_file(&fx, "inflight").await;
        let created = fx.transfers.create(link(vec![file.id], true)).await.unwrap();

        let gate = fx.storage.hold_gets().await;
        let transfers = fx.transfers.clone();
        let token = created.download_token.clone();
        let pending = tokio::spawn(async move { transfers.download(&token, None, None).await });
        fx.storage.get_started().await;

        let report = fx.scheduler.run_once().await;
        assert_eq!(report.consumed_transfers, 0);
        assert!(fx.storage.exists(&file.storage_path).await);

        drop(gate);
        let download = pending.await.unwrap().unwrap();
        assert_eq!(download.content, b"inflight");

        let report = fx.scheduler.run_once().await;
        assert_eq!(report.consumed_transfers, 1);
        assert!(!fx.storage.exists(&file.storage_path).await);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fx = fixture().await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(fx.scheduler.clone().run(rx));

        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
