//! src/services/file_service.rs
//!
//! Metadata for finalized files plus the fetch-and-decrypt path. Rows live in
//! SQLite; bytes live in object storage.

use super::{
    encryption::{EncryptionError, Keyring},
    error::{TransferError, TransferResult},
    object_storage::ObjectStorage,
};
use crate::models::{
    file::StoredFile,
    upload::{BatchUpload, FinalizedUpload},
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::{error, warn};

pub(crate) const FILE_COLUMNS: &str =
    "id, original_name, storage_path, size, mime_type, encryption_key, expires_at, created_at";

#[derive(Clone)]
pub struct FileService {
    db: SqlitePool,
    storage: Arc<dyn ObjectStorage>,
    keyring: Keyring,
    file_ttl: chrono::Duration,
}

impl FileService {
    pub fn new(
        db: SqlitePool,
        storage: Arc<dyn ObjectStorage>,
        keyring: Keyring,
        file_ttl: chrono::Duration,
    ) -> Self {
        Self {
            db,
            storage,
            keyring,
            file_ttl,
        }
    }

    /// Persist metadata for a finalized upload. When the insert fails the
    /// object is removed again so it does not outlive its only reference.
    pub async fn record_upload(
        &self,
        upload: &FinalizedUpload,
        original_name: &str,
        mime_type: &str,
    ) -> TransferResult<StoredFile> {
        if upload.encryption_key.is_empty() {
            return Err(EncryptionError::UnknownKey(String::new()).into());
        }
        let now = Utc::now();
        let inserted = sqlx::query_as::<_, StoredFile>(&format!(
            "INSERT INTO files (original_name, storage_path, size, mime_type, encryption_key, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(original_name)
        .bind(&upload.path)
        .bind(i64::try_from(upload.size).unwrap_or(i64::MAX))
        .bind(mime_type)
        .bind(&upload.encryption_key)
        .bind(now + self.file_ttl)
        .bind(now)
        .fetch_one(&self.db)
        .await;

        match inserted {
            Ok(file) => Ok(file),
            Err(err) => {
                error!("failed to record upload {}: {}", upload.path, err);
                if let Err(cleanup) = self.storage.delete(&upload.path).await {
                    warn!("failed to remove unrecorded object {}: {}", upload.path, cleanup);
                }
                Err(err.into())
            }
        }
    }

    /// Record a finalized batch in request order. On failure the batch is
    /// undone: recorded files are deleted and remaining objects removed.
    pub async fn record_batch(
        &self,
        uploads: &[BatchUpload],
        finalized: &[FinalizedUpload],
    ) -> TransferResult<Vec<StoredFile>> {
        let mut recorded = Vec::with_capacity(finalized.len());
        for (index, (upload, done)) in uploads.iter().zip(finalized).enumerate() {
            match self
                .record_upload(done, &upload.filename, &upload.mime_type)
                .await
            {
                Ok(file) => recorded.push(file),
                Err(err) => {
                    for leftover in &finalized[index..] {
                        if let Err(cleanup) = self.storage.delete(&leftover.path).await {
                            warn!(
                                "failed to remove unrecorded object {}: {}",
                                leftover.path, cleanup
                            );
                        }
                    }
                    for file in &recorded {
                        if let Err(cleanup) = self.purge_file(file).await {
                            warn!("failed to undo recorded file {}: {}", file.id, cleanup);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(recorded)
    }

    pub async fn find(&self, id: i64) -> TransferResult<Option<StoredFile>> {
        Ok(sqlx::query_as::<_, StoredFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?)
    }

    /// Files for every id in `ids` that exists, ordered by id.
    pub async fn find_existing(&self, ids: &[i64]) -> TransferResult<Vec<StoredFile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id IN ("
        ));
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");
        Ok(qb
            .build_query_as::<StoredFile>()
            .fetch_all(&self.db)
            .await?)
    }

    /// Resolve a requested file set, rejecting empty sets and unknown ids.
    pub async fn require_all(&self, ids: &[i64]) -> TransferResult<Vec<StoredFile>> {
        let mut unique = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();
        if unique.is_empty() {
            return Err(TransferError::validation("at least one file is required"));
        }

        let files = self.find_existing(&unique).await?;
        if files.len() != unique.len() {
            return Err(TransferError::validation("unknown file id"));
        }
        Ok(files)
    }

    pub async fn is_recorded(&self, storage_path: &str) -> TransferResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE storage_path = ?")
            .bind(storage_path)
            .fetch_one(&self.db)
            .await?;
        Ok(count > 0)
    }

    /// Remove a file's object and then its row. Join rows cascade.
    pub async fn delete_file(&self, id: i64) -> TransferResult<()> {
        let file = self
            .find(id)
            .await?
            .ok_or(TransferError::NotFoundOrExpired)?;
        self.storage.delete(&file.storage_path).await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file.id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Fetch and decrypt a file. Empty plaintext is treated as corruption.
    pub async fn get_decrypted_file(&self, file: &StoredFile) -> TransferResult<Vec<u8>> {
        let object = self.storage.get(&file.storage_path).await?;
        let plaintext = self.keyring.open_object(&file.encryption_key, &object)?;
        if plaintext.is_empty() {
            error!(
                "stored file {} ({}) decrypted to empty content",
                file.id, file.storage_path
            );
            return Err(TransferError::EmptyContent(file.id));
        }
        Ok(plaintext)
    }

    /// Delete the objects of `files`. Every deletion is attempted; the first
    /// failure is reported.
    pub async fn delete_remote_objects(&self, files: &[StoredFile]) -> TransferResult<()> {
        let results = join_all(
            files
                .iter()
                .map(|file| self.storage.delete(&file.storage_path)),
        )
        .await;
        for (file, result) in files.iter().zip(&results) {
            if let Err(err) = result {
                warn!("failed to delete object {}: {}", file.storage_path, err);
            }
        }
        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Expired files that no transfer or direct transfer references.
    pub async fn orphaned_files(&self, now: DateTime<Utc>) -> TransferResult<Vec<StoredFile>> {
        Ok(sqlx::query_as::<_, StoredFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE expires_at <= ?
               AND NOT EXISTS (SELECT 1 FROM transfer_files tf WHERE tf.file_id = files.id)
               AND NOT EXISTS (SELECT 1 FROM direct_transfer_files df WHERE df.file_id = files.id)
             ORDER BY id"
        ))
        .bind(now)
        .fetch_all(&self.db)
        .await?)
    }

    /// Object first, then row, so a crash leaves a row to retry from.
    pub async fn purge_file(&self, file: &StoredFile) -> TransferResult<()> {
        self.storage.delete(&file.storage_path).await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file.id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Purge a grant and every file it links: all remote objects first, then
    /// join rows, file rows and the grant row in one transaction. A remote
    /// failure leaves the rows in place for a later retry. Returns the number
    /// of files removed.
    pub(crate) async fn purge_linked(
        &self,
        owner_table: &str,
        join_table: &str,
        owner_column: &str,
        owner_id: i64,
    ) -> TransferResult<usize> {
        let files = files_of(&self.db, join_table, owner_column, owner_id).await?;
        self.delete_remote_objects(&files).await?;

        let mut tx = self.db.begin().await?;
        sqlx::query(&format!("DELETE FROM {join_table} WHERE {owner_column} = ?"))
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;
        if !files.is_empty() {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM files WHERE id IN (");
            let mut separated = qb.separated(", ");
            for file in &files {
                separated.push_bind(file.id);
            }
            separated.push_unseparated(")");
            qb.build().execute(&mut *tx).await?;
        }
        sqlx::query(&format!("DELETE FROM {owner_table} WHERE id = ?"))
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(files.len())
    }
}

/// Files linked to a transfer through `join_table`, ordered by id.
pub(crate) async fn files_of(
    db: &SqlitePool,
    join_table: &str,
    owner_column: &str,
    owner_id: i64,
) -> TransferResult<Vec<StoredFile>> {
    let columns = FILE_COLUMNS
        .split(", ")
        .map(|column| format!("f.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(sqlx::query_as::<_, StoredFile>(&format!(
        "SELECT {columns} FROM files f
         JOIN {join_table} j ON j.file_id = f.id
         WHERE j.{owner_column} = ?
         ORDER BY f.id"
    ))
    .bind(owner_id)
    .fetch_all(db)
    .await?)
}
