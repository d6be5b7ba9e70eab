//! src/services/direct_transfer_service.rs
//!
//! QR/PIN transfers from one device to another in the same room.
//!
//! Checking a PIN never consumes anything. Each file can be fetched once,
//! with token and PIN, and the transfer becomes `used` when its last file
//! has been fetched. That download carries the purge of the whole transfer.

use super::{
    error::{TransferError, TransferResult},
    file_service::{FileService, files_of},
    secrets::{self, SecretHasher},
};
use crate::models::{
    direct_transfer::{
        DirectTransfer, DirectTransferFile, DirectTransferListing, DirectTransferTicket,
    },
    file::{Download, FileSummary, PurgeTarget, StoredFile},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::collections::HashMap;
use tracing::info;

const DIRECT_COLUMNS: &str = "id, token, pin_hash, expires_at, used, created_at";
const PIN_LEN: usize = 6;

fn ensure_pin_shape(pin: &str) -> TransferResult<()> {
    if pin.len() != PIN_LEN || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TransferError::validation("PIN must be 6 digits"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct DirectTransferService {
    db: SqlitePool,
    files: FileService,
    hasher: SecretHasher,
    frontend_url: String,
    ttl: chrono::Duration,
}

impl DirectTransferService {
    pub fn new(
        db: SqlitePool,
        files: FileService,
        hasher: SecretHasher,
        frontend_url: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            db,
            files,
            hasher,
            frontend_url: frontend_url.into(),
            ttl,
        }
    }

    /// Create a transfer over existing files and hand back the only copy of
    /// its PIN.
    pub async fn generate(&self, file_ids: &[i64]) -> TransferResult<DirectTransferTicket> {
        let files = self.files.require_all(file_ids).await?;
        let token = secrets::direct_token();
        let pin = secrets::pin();
        let pin_hash = self.hasher.hash(&pin)?;
        let now = Utc::now();
        let expires_at = now + self.ttl;

        let mut tx = self.db.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO direct_transfers (token, pin_hash, expires_at, used, created_at)
             VALUES (?, ?, ?, 0, ?)
             RETURNING id",
        )
        .bind(&token)
        .bind(&pin_hash)
        .bind(expires_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO direct_transfer_files (direct_transfer_id, file_id, downloaded) ",
        );
        qb.push_values(&files, |mut row, file| {
            row.push_bind(id).push_bind(file.id).push_bind(false);
        });
        qb.build().execute(&mut *tx).await?;
        tx.commit().await?;

        info!("created direct transfer {} with {} file(s)", id, files.len());

        let qr_data = format!(
            "{}/send/direct/{}",
            self.frontend_url.trim_end_matches('/'),
            token
        );
        Ok(DirectTransferTicket {
            id,
            token,
            pin,
            qr_data,
            expires_at,
        })
    }

    async fn live_transfer(&self, token: &str) -> TransferResult<DirectTransfer> {
        let found = sqlx::query_as::<_, DirectTransfer>(&format!(
            "SELECT {DIRECT_COLUMNS} FROM direct_transfers WHERE token = ?"
        ))
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        match found {
            Some(transfer) if !transfer.is_expired(Utc::now()) => Ok(transfer),
            _ => Err(TransferError::NotFoundOrExpired),
        }
    }

    /// Live, unused transfer whose PIN matches.
    async fn authorize(&self, token: &str, pin: &str) -> TransferResult<DirectTransfer> {
        ensure_pin_shape(pin)?;
        let transfer = self.live_transfer(token).await?;
        if transfer.used {
            return Err(TransferError::AlreadyUsed);
        }
        if !self.hasher.verify(pin, &transfer.pin_hash) {
            return Err(TransferError::InvalidPin);
        }
        Ok(transfer)
    }

    async fn linked_files(
        &self,
        transfer_id: i64,
    ) -> TransferResult<Vec<(StoredFile, bool)>> {
        let files = files_of(
            &self.db,
            "direct_transfer_files",
            "direct_transfer_id",
            transfer_id,
        )
        .await?;
        let flags: HashMap<i64, bool> = sqlx::query_as::<_, (i64, bool)>(
            "SELECT file_id, downloaded FROM direct_transfer_files WHERE direct_transfer_id = ?",
        )
        .bind(transfer_id)
        .fetch_all(&self.db)
        .await?
        .into_iter()
        .collect();

        Ok(files
            .into_iter()
            .map(|file| {
                let downloaded = flags.get(&file.id).copied().unwrap_or(false);
                (file, downloaded)
            })
            .collect())
    }

    async fn file_listing(&self, transfer_id: i64) -> TransferResult<Vec<DirectTransferFile>> {
        Ok(self
            .linked_files(transfer_id)
            .await?
            .iter()
            .map(|(file, downloaded)| DirectTransferFile {
                file: FileSummary::from(file),
                downloaded: *downloaded,
            })
            .collect())
    }

    /// Check the PIN and list the files. Repeatable.
    pub async fn validate_pin(
        &self,
        token: &str,
        pin: &str,
    ) -> TransferResult<Vec<DirectTransferFile>> {
        let transfer = self.authorize(token, pin).await?;
        self.file_listing(transfer.id).await
    }

    /// Listing without the PIN. Exposes names and sizes only.
    pub async fn find_transfer(&self, token: &str) -> TransferResult<DirectTransferListing> {
        let transfer = self.live_transfer(token).await?;
        if transfer.used {
            return Err(TransferError::AlreadyUsed);
        }
        Ok(DirectTransferListing {
            files: self.file_listing(transfer.id).await?,
            token: transfer.token,
            expires_at: transfer.expires_at,
        })
    }

    /// Serve one file once. Content is fetched first; the file claim and
    /// the `used` flip then commit together, so any failure leaves the file
    /// downloadable.
    pub async fn download(&self, token: &str, pin: &str, file_id: i64) -> TransferResult<Download> {
        let transfer = self.authorize(token, pin).await?;
        let (file, downloaded) = self
            .linked_files(transfer.id)
            .await?
            .into_iter()
            .find(|(file, _)| file.id == file_id)
            .ok_or(TransferError::NotFoundOrExpired)?;
        if downloaded {
            return Err(TransferError::AlreadyUsed);
        }

        let content = match self.files.get_decrypted_file(&file).await {
            Ok(content) => content,
            Err(err) => return Err(self.fetch_failure(transfer.id, file.id, err).await),
        };

        let completed = self.claim_file(transfer.id, file.id).await?;
        if completed {
            info!("direct transfer {} fully downloaded", transfer.id);
        }

        Ok(Download {
            file,
            content,
            purge: completed.then_some(PurgeTarget::DirectTransfer(transfer.id)),
        })
    }

    /// Mark one file downloaded and, if it was the last, the transfer used.
    /// Returns whether this claim completed the transfer.
    async fn claim_file(&self, transfer_id: i64, file_id: i64) -> TransferResult<bool> {
        let mut tx = self.db.begin().await?;
        let claimed = sqlx::query(
            "UPDATE direct_transfer_files SET downloaded = 1
             WHERE direct_transfer_id = ? AND file_id = ? AND downloaded = 0",
        )
        .bind(transfer_id)
        .bind(file_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if claimed == 0 {
            return Err(TransferError::AlreadyUsed);
        }

        let completed = sqlx::query(
            "UPDATE direct_transfers SET used = 1
             WHERE id = ? AND used = 0
               AND NOT EXISTS (SELECT 1 FROM direct_transfer_files
                               WHERE direct_transfer_id = ? AND downloaded = 0)",
        )
        .bind(transfer_id)
        .bind(transfer_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(completed == 1)
    }

    /// A concurrent reader may have taken the file, and its purge removed
    /// the object, while we read it.
    async fn fetch_failure(
        &self,
        transfer_id: i64,
        file_id: i64,
        err: TransferError,
    ) -> TransferError {
        let state: Result<Option<bool>, sqlx::Error> = sqlx::query_scalar(
            "SELECT downloaded FROM direct_transfer_files
             WHERE direct_transfer_id = ? AND file_id = ?",
        )
        .bind(transfer_id)
        .bind(file_id)
        .fetch_optional(&self.db)
        .await;
        match state {
            Ok(Some(true)) => TransferError::AlreadyUsed,
            Ok(None) => TransferError::NotFoundOrExpired,
            _ => err,
        }
    }

    pub async fn purge(&self, transfer_id: i64) -> TransferResult<()> {
        let purged = self
            .files
            .purge_linked(
                "direct_transfers",
                "direct_transfer_files",
                "direct_transfer_id",
                transfer_id,
            )
            .await?;
        info!("purged direct transfer {} and {} file(s)", transfer_id, purged);
        Ok(())
    }

    pub async fn expired_ids(&self, now: DateTime<Utc>) -> TransferResult<Vec<i64>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM direct_transfers WHERE expires_at <= ? ORDER BY id")
                .bind(now)
                .fetch_all(&self.db)
                .await?,
        )
    }

    pub async fn used_ids(&self) -> TransferResult<Vec<i64>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM direct_transfers WHERE used = 1 ORDER BY id")
                .fetch_all(&self.db)
                .await?,
        )
    }
}
