//! Shared fixtures for service and handler tests.

use crate::{
    config::AppConfig,
    db::test_pool,
    services::{
        encryption::{KEY_LEN, Keyring},
        kv::MemoryKv,
        notification::{MailError, Mailer, NotificationQueue, TransferNotification},
        object_storage::{LocalObjectStorage, ObjectStorage, StorageError, StorageResult},
        secrets::cheap_hasher,
    },
    state::AppState,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

pub fn test_keyring() -> Keyring {
    Keyring::new("test", vec![42; KEY_LEN]).unwrap()
}

/// Full application state over an in-memory database, [`MemoryKv`] and
/// disk storage under `dir`.
pub async fn test_state_with_mailer(
    dir: &Path,
    cfg: &AppConfig,
    mailer: Arc<dyn Mailer>,
) -> AppState {
    let (notifications, _outbox) = NotificationQueue::new();
    AppState::new(
        cfg,
        test_pool().await,
        Arc::new(MemoryKv::new()),
        Arc::new(LocalObjectStorage::new(dir)),
        test_keyring(),
        cheap_hasher(),
        notifications,
        mailer,
    )
}

/// Keeps every verification code it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    codes: Mutex<Vec<(String, String)>>,
}

impl RecordingMailer {
    /// Most recent code sent to `email`.
    pub fn last_code(&self, email: &str) -> Option<String> {
        self.codes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, code)| code.clone())
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, _: &TransferNotification) -> Result<(), MailError> {
        Ok(())
    }

    async fn send_verification_code(&self, email: &str, code: &str) -> Result<(), MailError> {
        self.codes
            .lock()
            .unwrap()
            .push((email.to_string(), code.to_string()));
        Ok(())
    }
}

/// Local disk storage with switchable failure injection.
#[derive(Debug)]
pub struct FlakyStorage {
    inner: LocalObjectStorage,
    fail_uploads: AtomicBool,
    fail_gets: AtomicBool,
    fail_deletes: AtomicBool,
    deletes: Mutex<Vec<String>>,
    get_gate: Arc<AsyncMutex<()>>,
    get_entered: Notify,
}

impl FlakyStorage {
    pub fn new(dir: &Path) -> Self {
        Self {
            inner: LocalObjectStorage::new(dir),
            fail_uploads: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            deletes: Mutex::new(Vec::new()),
            get_gate: Arc::new(AsyncMutex::new(())),
            get_entered: Notify::new(),
        }
    }

    /// Block every `get` until the returned guard is dropped.
    pub async fn hold_gets(&self) -> OwnedMutexGuard<()> {
        self.get_gate.clone().lock_owned().await
    }

    /// Wait until some `get` has been entered.
    pub async fn get_started(&self) {
        self.get_entered.notified().await;
    }

    pub fn fail_uploads(&self, on: bool) {
        self.fail_uploads.store(on, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, on: bool) {
        self.fail_gets.store(on, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }

    /// Every path `delete` was called with, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.inner.get(path).await.is_ok()
    }
}

#[async_trait]
impl ObjectStorage for FlakyStorage {
    async fn upload(&self, content: Bytes, path: &str) -> StorageResult<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("injected upload failure".into()));
        }
        self.inner.upload(content, path).await
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        self.get_entered.notify_one();
        let _open = self.get_gate.lock().await;
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("injected get failure".into()));
        }
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.deletes.lock().unwrap().push(path.to_string());
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("injected delete failure".into()));
        }
        self.inner.delete(path).await
    }

    async fn probe(&self) -> StorageResult<()> {
        self.inner.probe().await
    }
}
