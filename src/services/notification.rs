//! src/services/notification.rs
//!
//! Email notifications for new transfers. Creating a transfer only hands a
//! message to an in-process queue; a worker delivers it through a [`Mailer`]
//! with bounded retries, so delivery never affects the transfer itself.
//! Verification codes go through the same [`Mailer`] but are sent inline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TransferNotification {
    pub transfer_id: i64,
    pub sender_email: String,
    pub recipient_email: String,
    pub message: Option<String>,
    pub download_token: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, notification: &TransferNotification) -> Result<(), MailError>;

    async fn send_verification_code(&self, email: &str, code: &str) -> Result<(), MailError>;
}

/// Records notifications in the log instead of sending them. Download
/// tokens and verification codes are credentials and are never logged.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, notification: &TransferNotification) -> Result<(), MailError> {
        info!(
            transfer_id = notification.transfer_id,
            from = %notification.sender_email,
            to = %notification.recipient_email,
            expires_at = %notification.expires_at,
            "transfer notification recorded"
        );
        Ok(())
    }

    async fn send_verification_code(&self, email: &str, _code: &str) -> Result<(), MailError> {
        info!(to = %email, "verification code recorded");
        Ok(())
    }
}

/// Sending half of the notification queue.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<TransferNotification>,
}

impl NotificationQueue {
    pub fn new() -> (Self, mpsc::Receiver<TransferNotification>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Hand off without waiting. A full or closed queue drops the message.
    pub fn enqueue(&self, notification: TransferNotification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(err) => {
                error!("dropping transfer notification: {}", err);
                false
            }
        }
    }
}

pub struct NotificationWorker {
    rx: mpsc::Receiver<TransferNotification>,
    mailer: Arc<dyn Mailer>,
    max_attempts: u32,
    base_delay: Duration,
}

impl NotificationWorker {
    pub fn new(
        rx: mpsc::Receiver<TransferNotification>,
        mailer: Arc<dyn Mailer>,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            rx,
            mailer,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Deliver queued notifications until shutdown or until every sender is
    /// gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("notification worker stopping");
                    return;
                }
                next = self.rx.recv() => match next {
                    Some(notification) => {
                        self.deliver(&notification).await;
                    }
                    None => return,
                },
            }
        }
    }

    /// Try up to `max_attempts` times, doubling the delay between attempts.
    /// Returns whether the notification was delivered.
    pub async fn deliver(&self, notification: &TransferNotification) -> bool {
        let mut delay = self.base_delay;
        for attempt in 1..=self.max_attempts {
            match self.mailer.send(notification).await {
                Ok(()) => return true,
                Err(err) if attempt < self.max_attempts => {
                    warn!(
                        "notification for transfer {} failed (attempt {}/{}): {}",
                        notification.transfer_id, attempt, self.max_attempts, err
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => {
                    error!(
                        "giving up on notification for transfer {} after {} attempts: {}",
                        notification.transfer_id, attempt, err
                    );
                }
            }
        }
        false
    }
}
