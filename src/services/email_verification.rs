//! src/services/email_verification.rs
//!
//! Sender address verification. A six digit code is mailed to the address
//! and kept, hashed, in the key-value store for a short while. Presenting it
//! consumes the code and marks the address verified for a longer period.
//! Each code tolerates a handful of wrong guesses before it is discarded.

use super::{
    error::{TransferError, TransferResult},
    kv::KvStore,
    notification::Mailer,
    secrets::{self, SecretHasher},
    transfer_service::is_valid_email,
};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

const CODE_LEN: usize = 6;
const MAX_ATTEMPTS: i64 = 5;

fn code_key(email: &str) -> String {
    format!("email_verification:{email}")
}

fn attempts_key(email: &str) -> String {
    format!("email_verification_attempts:{email}")
}

fn verified_key(email: &str) -> String {
    format!("verified_email:{email}")
}

/// Addresses compare case-insensitively and without surrounding blanks.
fn normalize(email: &str) -> Option<String> {
    let email = email.trim().to_ascii_lowercase();
    is_valid_email(&email).then_some(email)
}

#[derive(Clone)]
pub struct EmailVerificationService {
    kv: Arc<dyn KvStore>,
    mailer: Arc<dyn Mailer>,
    hasher: SecretHasher,
    code_ttl: Duration,
    verified_ttl: Duration,
}

impl EmailVerificationService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        mailer: Arc<dyn Mailer>,
        hasher: SecretHasher,
        code_ttl: Duration,
        verified_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            mailer,
            hasher,
            code_ttl,
            verified_ttl,
        }
    }

    /// Issue a fresh code, replacing any outstanding one, and mail it.
    pub async fn request_code(&self, email: &str) -> TransferResult<()> {
        let email = normalize(email)
            .ok_or_else(|| TransferError::validation("a valid `email` is required"))?;
        let code = secrets::verification_code();
        let hash = self.hasher.hash(&code)?;

        self.kv
            .delete(&[code_key(&email), attempts_key(&email)])
            .await?;
        self.kv
            .hash_set(
                &code_key(&email),
                vec![("hash".to_string(), Bytes::from(hash))],
                Some(self.code_ttl),
            )
            .await?;
        self.mailer.send_verification_code(&email, &code).await?;
        info!("verification code issued for {}", email);
        Ok(())
    }

    /// Check `code` against the outstanding one. A match consumes the code
    /// and marks the address verified.
    pub async fn verify(&self, email: &str, code: &str) -> TransferResult<()> {
        let email = normalize(email)
            .ok_or_else(|| TransferError::validation("a valid `email` is required"))?;
        let code = code.trim();
        if code.len() != CODE_LEN || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TransferError::validation("`code` must be 6 digits"));
        }

        let Some(hash) = self.kv.hash_get(&code_key(&email), "hash").await? else {
            return Err(TransferError::InvalidVerificationCode);
        };
        let keys = [code_key(&email), attempts_key(&email)];
        let attempts = self
            .kv
            .incr_within_window(&attempts_key(&email), 1, self.code_ttl)
            .await?;
        if attempts > MAX_ATTEMPTS {
            warn!("too many wrong codes for {}, discarding", email);
            self.kv.delete(&keys).await?;
            return Err(TransferError::InvalidVerificationCode);
        }
        if !self.hasher.verify(code, &String::from_utf8_lossy(&hash)) {
            return Err(TransferError::InvalidVerificationCode);
        }

        self.kv.delete(&keys).await?;
        self.kv
            .hash_set(
                &verified_key(&email),
                vec![("verified".to_string(), Bytes::from_static(b"1"))],
                Some(self.verified_ttl),
            )
            .await?;
        info!("email {} verified", email);
        Ok(())
    }

    /// Malformed addresses are simply not verified.
    pub async fn is_verified(&self, email: &str) -> TransferResult<bool> {
        let Some(email) = normalize(email) else {
            return Ok(false);
        };
        Ok(self
            .kv
            .hash_get(&verified_key(&email), "verified")
            .await?
            .is_some())
    }

    pub async fn require_verified(&self, email: &str) -> TransferResult<()> {
        if self.is_verified(email).await? {
            Ok(())
        } else {
            Err(TransferError::SenderNotVerified(email.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{kv::MemoryKv, secrets::cheap_hasher},
        test_support::RecordingMailer,
    };

    const CODE_TTL: Duration = Duration::from_secs(15 * 60);
    const VERIFIED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    fn service(mailer: Arc<RecordingMailer>) -> EmailVerificationService {
        EmailVerificationService::new(
            Arc::new(MemoryKv::new()),
            mailer,
            cheap_hasher(),
            CODE_TTL,
            VERIFIED_TTL,
        )
    }

    /// A six digit code guaranteed not to match `code`.
    fn other_than(code: &str) -> String {
        if code == "000000" { "000001" } else { "000000" }.to_string()
    }

    #[tokio::test]
    async fn code_verifies_once_and_marks_the_address() {
        let mailer = Arc::new(RecordingMailer::default());
        let service = service(mailer.clone());

        service.request_code(" Sender@Example.com ").await.unwrap();
        let code = mailer.last_code("sender@example.com").unwrap();
        assert!(!service.is_verified("sender@example.com").await.unwrap());

        service.verify("SENDER@example.com", &code).await.unwrap();
        assert!(service.is_verified("sender@example.com").await.unwrap());
        assert!(service.is_verified(" Sender@Example.com").await.unwrap());

        assert!(matches!(
            service.verify("sender@example.com", &code).await,
            Err(TransferError::InvalidVerificationCode)
        ));
    }

    #[tokio::test]
    async fn wrong_or_missing_codes_are_rejected() {
        let mailer = Arc::new(RecordingMailer::default());
        let service = service(mailer.clone());

        assert!(matches!(
            service.verify("nobody@example.com", "123456").await,
            Err(TransferError::InvalidVerificationCode)
        ));

        service.request_code("a@example.com").await.unwrap();
        let code = mailer.last_code("a@example.com").unwrap();
        assert!(matches!(
            service.verify("a@example.com", &other_than(&code)).await,
            Err(TransferError::InvalidVerificationCode)
        ));
        for malformed in ["12345", "1234567", "12a456"] {
            assert!(matches!(
                service.verify("a@example.com", malformed).await,
                Err(TransferError::Validation(_))
            ));
        }
        assert!(matches!(
            service.request_code("not-an-email").await,
            Err(TransferError::Validation(_))
        ));
        assert!(!service.is_verified("not-an-email").await.unwrap());

        service.verify("a@example.com", &code).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_wrong_guesses_discard_the_code() {
        let mailer = Arc::new(RecordingMailer::default());
        let service = service(mailer.clone());
        service.request_code("b@example.com").await.unwrap();
        let code = mailer.last_code("b@example.com").unwrap();

        for _ in 0..MAX_ATTEMPTS {
            assert!(
                service
                    .verify("b@example.com", &other_than(&code))
                    .await
                    .is_err()
            );
        }
        assert!(matches!(
            service.verify("b@example.com", &code).await,
            Err(TransferError::InvalidVerificationCode)
        ));
        assert!(!service.is_verified("b@example.com").await.unwrap());

        // A new code starts with a clean slate.
        service.request_code("b@example.com").await.unwrap();
        let fresh = mailer.last_code("b@example.com").unwrap();
        service.verify("b@example.com", &fresh).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn codes_and_verification_expire() {
        let mailer = Arc::new(RecordingMailer::default());
        let service = service(mailer.clone());

        service.request_code("c@example.com").await.unwrap();
        let code = mailer.last_code("c@example.com").unwrap();
        tokio::time::advance(CODE_TTL + Duration::from_secs(1)).await;
        assert!(matches!(
            service.verify("c@example.com", &code).await,
            Err(TransferError::InvalidVerificationCode)
        ));

        service.request_code("c@example.com").await.unwrap();
        let code = mailer.last_code("c@example.com").unwrap();
        service.verify("c@example.com", &code).await.unwrap();
        tokio::time::advance(VERIFIED_TTL + Duration::from_secs(1)).await;
        assert!(!service.is_verified("c@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn codes_are_stored_hashed() {
        let mailer = Arc::new(RecordingMailer::default());
        let kv = Arc::new(MemoryKv::new());
        let service = EmailVerificationService::new(
            kv.clone(),
            mailer.clone(),
            cheap_hasher(),
            CODE_TTL,
            VERIFIED_TTL,
        );
        service.request_code("d@example.com").await.unwrap();
        let code = mailer.last_code("d@example.com").unwrap();

        let stored = kv
            .hash_get("email_verification:d@example.com", "hash")
            .await
            .unwrap()
            .unwrap();
        let stored = String::from_utf8_lossy(&stored);
        assert!(stored.starts_with("$argon2id$"));
        assert!(!stored.contains(&code));
    }
}
