//! src/services/secrets.rs
//!
//! Password/PIN hashing and token and code generation.

use super::error::{TransferError, TransferResult};
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::{SaltString, rand_core::OsRng},
};
use rand::Rng;
use uuid::Uuid;

const DOWNLOAD_TOKEN_LEN: usize = 32;

/// Argon2 hasher for transfer passwords and direct-transfer PINs.
#[derive(Clone)]
pub struct SecretHasher {
    argon2: Argon2<'static>,
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }
}

impl SecretHasher {
    /// Hasher with explicit cost parameters.
    pub fn with_params(params: Params) -> Self {
        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    pub fn hash(&self, secret: &str) -> TransferResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| TransferError::Hashing(err.to_string()))
    }

    /// Constant-time comparison of `secret` against a PHC hash string. A hash
    /// that cannot be parsed never verifies.
    pub fn verify(&self, secret: &str, hash: &str) -> bool {
        let parsed = match PasswordHash::new(hash) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::error!("failed to parse secret hash: {}", err);
                return false;
            }
        };

        self.argon2
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok()
    }
}

/// Unguessable token for link and email transfers.
pub fn download_token() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(DOWNLOAD_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Token embedded in a direct-transfer QR code.
pub fn direct_token() -> String {
    Uuid::new_v4().to_string()
}

/// Six digit PIN, never starting with zero.
pub fn pin() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

/// Six digit email verification code, zero padded.
pub fn verification_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

#[cfg(test)]
pub(crate) fn cheap_hasher() -> SecretHasher {
    SecretHasher::with_params(Params::new(1024, 1, 1, None).unwrap())
}
