//! src/services/encryption.rs
//!
//! Symmetric sealing for upload chunks and the framed at-rest object format.
//!
//! A sealed chunk is `nonce (12 bytes) || ciphertext || tag (16 bytes)` using
//! AES-256-GCM, so a corrupted or truncated chunk fails authentication instead
//! of decrypting to garbage. A finalized object is the index-ordered
//! concatenation of sealed chunks, each prefixed with its length as a
//! big-endian `u32`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use bytes::{BufMut, Bytes, BytesMut};
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    InvalidKey(usize),
    #[error("unknown encryption key `{0}`")]
    UnknownKey(String),
    #[error("encryption failed")]
    Encryption,
    #[error("ciphertext is malformed or failed authentication")]
    Decryption,
    #[error("sealed chunk of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),
}

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKey(key.len()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EncryptionError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a blob produced by [`encrypt`]. The leading nonce is split off first.
pub fn decrypt(sealed: &[u8], key: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKey(key.len()))?;
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(EncryptionError::Decryption);
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EncryptionError::Decryption)
}

/// Concatenate sealed chunks into the stored object format.
pub fn join_frames<B: AsRef<[u8]>>(sealed: &[B]) -> Result<Bytes, EncryptionError> {
    let total = sealed
        .iter()
        .map(|chunk| FRAME_HEADER_LEN + chunk.as_ref().len())
        .sum();
    let mut object = BytesMut::with_capacity(total);
    for chunk in sealed {
        let chunk = chunk.as_ref();
        let len =
            u32::try_from(chunk.len()).map_err(|_| EncryptionError::FrameTooLarge(chunk.len()))?;
        object.put_u32(len);
        object.extend_from_slice(chunk);
    }
    Ok(object.freeze())
}

/// Split a stored object back into its sealed chunks.
pub fn split_frames(object: &[u8]) -> Result<Vec<&[u8]>, EncryptionError> {
    let mut frames = Vec::new();
    let mut rest = object;
    while !rest.is_empty() {
        if rest.len() < FRAME_HEADER_LEN {
            return Err(EncryptionError::Decryption);
        }
        let (header, tail) = rest.split_at(FRAME_HEADER_LEN);
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if tail.len() < len {
            return Err(EncryptionError::Decryption);
        }
        let (frame, next) = tail.split_at(len);
        frames.push(frame);
        rest = next;
    }
    Ok(frames)
}

/// Named key material. New chunks are sealed with the current key; stored
/// files record the key id so retired keys can still open older objects.
#[derive(Clone)]
pub struct Keyring {
    current: String,
    keys: Arc<HashMap<String, Vec<u8>>>,
}

impl Keyring {
    pub fn new(id: impl Into<String>, key: Vec<u8>) -> Result<Self, EncryptionError> {
        if key.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKey(key.len()));
        }
        let id = id.into();
        let mut keys = HashMap::new();
        keys.insert(id.clone(), key);
        Ok(Self {
            current: id,
            keys: Arc::new(keys),
        })
    }

    /// Register a key that can still decrypt but is never used to seal.
    pub fn with_retired_key(
        mut self,
        id: impl Into<String>,
        key: Vec<u8>,
    ) -> Result<Self, EncryptionError> {
        if key.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKey(key.len()));
        }
        let id = id.into();
        if id != self.current {
            Arc::make_mut(&mut self.keys).insert(id, key);
        }
        Ok(self)
    }

    pub fn current_id(&self) -> &str {
        &self.current
    }

    fn key(&self, id: &str) -> Result<&[u8], EncryptionError> {
        self.keys
            .get(id)
            .map(Vec::as_slice)
            .ok_or_else(|| EncryptionError::UnknownKey(id.to_string()))
    }

    /// Seal one upload chunk with the current key.
    pub fn seal_chunk(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        encrypt(plaintext, self.key(&self.current)?)
    }

    /// Decrypt a finalized object sealed under `key_id`.
    pub fn open_object(&self, key_id: &str, object: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let key = self.key(key_id)?;
        let mut plaintext = Vec::with_capacity(object.len());
        for frame in split_frames(object)? {
            plaintext.extend_from_slice(&decrypt(frame, key)?);
        }
        Ok(plaintext)
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("Keyring")
            .field("current", &self.current)
            .field("keys", &ids)
            .finish()
    }
}
