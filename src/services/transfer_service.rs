//! src/services/transfer_service.rs
//!
//! Link and email transfers: creation, status checks, downloads, deletion
//! and purges.
//!
//! A single-use download fetches and decrypts first, then claims the
//! transfer with a compare-and-swap on the `downloaded` column. Of two
//! concurrent requests exactly one wins and the loser drops its copy. A
//! transfer is never marked downloaded while its content is still in
//! flight, so the cleanup sweep cannot purge it from under a reader.

use super::{
    email_verification::EmailVerificationService,
    error::{TransferError, TransferResult},
    file_service::{FileService, files_of},
    notification::{NotificationQueue, TransferNotification},
    secrets::{self, SecretHasher},
};
use crate::models::{
    file::{Download, FileSummary, PurgeTarget, StoredFile},
    transfer::{CreatedTransfer, NewTransfer, Transfer, TransferKind, TransferStatus},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use tracing::info;

const TRANSFER_COLUMNS: &str = "id, kind, message, password_hash, sender_email, recipient_email, \
     download_token, expires_at, single_download, downloaded, created_at";
const MIN_PASSWORD_LEN: usize = 6;
const ALLOWED_EXPIRY_DAYS: [u32; 3] = [1, 2, 3];

/// Minimal shape check: one `@`, a non-empty local part and a dotted domain.
pub(crate) fn is_valid_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

#[derive(Clone)]
pub struct TransferService {
    db: SqlitePool,
    files: FileService,
    hasher: SecretHasher,
    notifications: NotificationQueue,
    sender_check: Option<EmailVerificationService>,
}

impl TransferService {
    pub fn new(
        db: SqlitePool,
        files: FileService,
        hasher: SecretHasher,
        notifications: NotificationQueue,
    ) -> Self {
        Self {
            db,
            files,
            hasher,
            notifications,
            sender_check: None,
        }
    }

    /// Only accept email transfers whose sender address has been verified.
    pub fn with_sender_verification(mut self, verifier: EmailVerificationService) -> Self {
        self.sender_check = Some(verifier);
        self
    }

    /// Validate and persist a transfer over existing files. Email transfers
    /// queue a notification; delivery never affects the result. With sender
    /// verification on, an unverified sender is refused before anything is
    /// written.
    pub async fn create(&self, new: NewTransfer) -> TransferResult<CreatedTransfer> {
        let days = new.expires_in_days.unwrap_or(1);
        if !ALLOWED_EXPIRY_DAYS.contains(&days) {
            return Err(TransferError::validation("expires_in must be 1, 2 or 3 days"));
        }

        let password = new.password.as_deref().filter(|p| !p.is_empty());
        if password.is_some_and(|p| p.chars().count() < MIN_PASSWORD_LEN) {
            return Err(TransferError::validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let (sender_email, recipient_email) = match new.kind {
            TransferKind::Email => {
                let sender = new.sender_email.as_deref().map(str::trim).unwrap_or("");
                let recipient = new.recipient_email.as_deref().map(str::trim).unwrap_or("");
                if !is_valid_email(sender) || !is_valid_email(recipient) {
                    return Err(TransferError::validation(
                        "email transfers need valid sender and recipient addresses",
                    ));
                }
                (Some(sender.to_string()), Some(recipient.to_string()))
            }
            TransferKind::Link => (None, None),
        };
        if let (Some(verifier), Some(sender)) = (&self.sender_check, &sender_email) {
            verifier.require_verified(sender).await?;
        }

        let files = self.files.require_all(&new.file_ids).await?;
        let password_hash = password.map(|p| self.hasher.hash(p)).transpose()?;
        let message = new.message.filter(|m| !m.trim().is_empty());
        let token = secrets::download_token();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::days(i64::from(days));

        let mut tx = self.db.begin().await?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO transfers (kind, message, password_hash, sender_email, recipient_email,
                                    download_token, expires_at, single_download, downloaded, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
             RETURNING id",
        )
        .bind(new.kind)
        .bind(&message)
        .bind(&password_hash)
        .bind(&sender_email)
        .bind(&recipient_email)
        .bind(&token)
        .bind(expires_at)
        .bind(new.single_download)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let mut qb =
            QueryBuilder::<Sqlite>::new("INSERT INTO transfer_files (transfer_id, file_id) ");
        qb.push_values(&files, |mut row, file| {
            row.push_bind(id).push_bind(file.id);
        });
        qb.build().execute(&mut *tx).await?;
        tx.commit().await?;

        info!(
            "created {:?} transfer {} with {} file(s)",
            new.kind,
            id,
            files.len()
        );

        if let (Some(sender_email), Some(recipient_email)) = (sender_email, recipient_email) {
            self.notifications.enqueue(TransferNotification {
                transfer_id: id,
                sender_email,
                recipient_email,
                message,
                download_token: token.clone(),
                expires_at,
            });
        }

        Ok(CreatedTransfer {
            id,
            download_token: token,
            expires_at,
        })
    }

    async fn find_by_token(&self, token: &str) -> TransferResult<Option<Transfer>> {
        Ok(sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE download_token = ?"
        ))
        .bind(token)
        .fetch_optional(&self.db)
        .await?)
    }

    /// Unknown and expired tokens are indistinguishable to callers.
    async fn live_transfer(&self, token: &str) -> TransferResult<Transfer> {
        match self.find_by_token(token).await? {
            Some(transfer) if !transfer.is_expired(Utc::now()) => Ok(transfer),
            _ => Err(TransferError::NotFoundOrExpired),
        }
    }

    async fn transfer_files(&self, transfer_id: i64) -> TransferResult<Vec<StoredFile>> {
        files_of(&self.db, "transfer_files", "transfer_id", transfer_id).await
    }

    /// Read-only status check. Never consumes a single-use transfer.
    pub async fn check_transfer(&self, token: &str) -> TransferResult<TransferStatus> {
        let transfer = self.live_transfer(token).await?;
        let files = self.transfer_files(transfer.id).await?;
        Ok(TransferStatus {
            kind: transfer.kind,
            message: transfer.message.clone(),
            expires_at: transfer.expires_at,
            password_protected: transfer.password_hash.is_some(),
            single_download: transfer.single_download,
            downloaded: transfer.downloaded,
            files: files.iter().map(FileSummary::from).collect(),
        })
    }

    /// Serve one file of a transfer. Without `file_id` the first file is
    /// served. A single-use transfer is claimed only once its content is in
    /// hand, and the returned [`Download`] carries the purge owed after the
    /// response.
    pub async fn download(
        &self,
        token: &str,
        password: Option<&str>,
        file_id: Option<i64>,
    ) -> TransferResult<Download> {
        let transfer = self.live_transfer(token).await?;
        if transfer.is_consumed() {
            return Err(TransferError::AlreadyUsed);
        }

        self.authorize(&transfer, password)?;

        let files = self.transfer_files(transfer.id).await?;
        let file = match file_id {
            Some(id) => files.into_iter().find(|file| file.id == id),
            None => files.into_iter().next(),
        }
        .ok_or(TransferError::NotFoundOrExpired)?;

        let content = match self.files.get_decrypted_file(&file).await {
            Ok(content) => content,
            Err(err) if transfer.single_download => {
                return Err(self.fetch_failure(transfer.id, err).await);
            }
            Err(err) => return Err(err),
        };

        if transfer.single_download {
            self.claim(&transfer).await?;
        }

        Ok(Download {
            file,
            content,
            purge: transfer
                .single_download
                .then_some(PurgeTarget::Transfer(transfer.id)),
        })
    }

    fn authorize(&self, transfer: &Transfer, password: Option<&str>) -> TransferResult<()> {
        let Some(hash) = &transfer.password_hash else {
            return Ok(());
        };
        match password.filter(|p| !p.is_empty()) {
            None => Err(TransferError::PasswordRequired),
            Some(supplied) if !self.hasher.verify(supplied, hash) => {
                Err(TransferError::InvalidPassword)
            }
            Some(_) => Ok(()),
        }
    }

    /// Withdraw a transfer before it expires. The token is the capability;
    /// a protected transfer also needs its password. Objects and rows go
    /// through the same purge the sweep uses.
    pub async fn delete_transfer(
        &self,
        token: &str,
        password: Option<&str>,
    ) -> TransferResult<()> {
        let transfer = self.live_transfer(token).await?;
        self.authorize(&transfer, password)?;
        self.purge_transfer(transfer.id).await?;
        info!("transfer {} deleted by its holder", transfer.id);
        Ok(())
    }

    /// A concurrent winner may purge the object while we read it. Report
    /// that as the transfer being used up rather than a storage fault.
    async fn fetch_failure(&self, transfer_id: i64, err: TransferError) -> TransferError {
        let state: Result<Option<bool>, sqlx::Error> =
            sqlx::query_scalar("SELECT downloaded FROM transfers WHERE id = ?")
                .bind(transfer_id)
                .fetch_optional(&self.db)
                .await;
        match state {
            Ok(Some(true)) => TransferError::AlreadyUsed,
            Ok(None) => TransferError::NotFoundOrExpired,
            _ => err,
        }
    }

    /// Flip `downloaded` only if nobody else has. Losing the race, or the
    /// transfer expiring meanwhile, means the caller gets nothing.
    async fn claim(&self, transfer: &Transfer) -> TransferResult<()> {
        let claimed = sqlx::query(
            "UPDATE transfers SET downloaded = 1
             WHERE id = ? AND downloaded = 0 AND expires_at > ?",
        )
        .bind(transfer.id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?
        .rows_affected();
        if claimed == 0 {
            return Err(TransferError::AlreadyUsed);
        }
        Ok(())
    }

    /// Delete every object of the transfer, then its rows. A remote failure
    /// leaves the rows for the next sweep. Files are removed with the
    /// transfer even if another grant links them.
    pub async fn purge_transfer(&self, transfer_id: i64) -> TransferResult<()> {
        let purged = self
            .files
            .purge_linked("transfers", "transfer_files", "transfer_id", transfer_id)
            .await?;
        info!("purged transfer {} and {} file(s)", transfer_id, purged);
        Ok(())
    }

    pub async fn expired_ids(&self, now: DateTime<Utc>) -> TransferResult<Vec<i64>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM transfers WHERE expires_at <= ? ORDER BY id")
                .bind(now)
                .fetch_all(&self.db)
                .await?,
        )
    }

    /// Single-use transfers already downloaded whose purge has not run.
    pub async fn consumed_ids(&self) -> TransferResult<Vec<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT id FROM transfers WHERE single_download = 1 AND downloaded = 1 ORDER BY id",
        )
        .fetch_all(&self.db)
        .await?)
    }
}
