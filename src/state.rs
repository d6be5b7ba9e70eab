//! Shared application state handed to every handler.

use crate::{
    config::AppConfig,
    services::{
        chunk_store::ChunkStore,
        cleanup::CleanupScheduler,
        direct_transfer_service::DirectTransferService,
        email_verification::EmailVerificationService,
        encryption::Keyring,
        file_service::FileService,
        kv::KvStore,
        notification::{Mailer, NotificationQueue},
        object_storage::ObjectStorage,
        rate_limit::RateLimiter,
        secrets::SecretHasher,
        transfer_service::TransferService,
    },
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Every backend is constructed once at startup and shared by reference.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub kv: Arc<dyn KvStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub chunks: ChunkStore,
    pub limiter: RateLimiter,
    pub files: FileService,
    pub transfers: TransferService,
    pub direct: DirectTransferService,
    pub email: EmailVerificationService,
    /// Base for download links handed out to clients.
    pub public_url: String,
    /// Take the client address from `X-Forwarded-For`.
    pub trust_forwarded_for: bool,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &AppConfig,
        db: SqlitePool,
        kv: Arc<dyn KvStore>,
        storage: Arc<dyn ObjectStorage>,
        keyring: Keyring,
        hasher: SecretHasher,
        notifications: NotificationQueue,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let chunks = ChunkStore::new(kv.clone(), storage.clone(), keyring.clone(), cfg.chunk_ttl);
        let limiter = RateLimiter::new(kv.clone(), cfg.upload_limit_bytes, cfg.upload_window);
        let files = FileService::new(
            db.clone(),
            storage.clone(),
            keyring,
            chrono::Duration::days(cfg.file_ttl_days),
        );
        let email = EmailVerificationService::new(
            kv.clone(),
            mailer,
            hasher.clone(),
            cfg.email_code_ttl,
            cfg.email_verified_ttl,
        );
        let mut transfers =
            TransferService::new(db.clone(), files.clone(), hasher.clone(), notifications);
        if cfg.require_verified_sender {
            transfers = transfers.with_sender_verification(email.clone());
        }
        let direct = DirectTransferService::new(
            db.clone(),
            files.clone(),
            hasher,
            cfg.frontend_url.clone(),
            chrono::Duration::minutes(cfg.direct_transfer_ttl_mins),
        );

        Self {
            db,
            kv,
            storage,
            chunks,
            limiter,
            files,
            transfers,
            direct,
            email,
            public_url: cfg.public_url.trim_end_matches('/').to_string(),
            trust_forwarded_for: cfg.trust_forwarded_for,
        }
    }

    pub fn download_link(&self, token: &str) -> String {
        format!("{}/api/download/{}", self.public_url, token)
    }

    pub fn cleanup_scheduler(&self, interval: std::time::Duration) -> CleanupScheduler {
        CleanupScheduler::new(
            self.transfers.clone(),
            self.direct.clone(),
            self.chunks.clone(),
            self.files.clone(),
            self.limiter.clone(),
            self.storage.clone(),
            interval,
        )
    }
}
