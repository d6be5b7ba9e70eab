//! src/services/kv.rs
//!
//! Fast ephemeral key-value store used for chunk sessions, progress, pending
//! upload tracking and rate-limit counters. Every multi-step operation on this
//! trait is atomic in each backend so callers never observe a counter without
//! its window or a chunk without its session TTL.

use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::HashMap, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};

#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] fred::error::RedisError),
    #[error("key `{0}` holds a value of another type")]
    WrongType(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The key does not exist.
    Missing,
    /// The key exists but never expires.
    Persistent,
    Expires(Duration),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Round-trip to the store.
    async fn ping(&self) -> KvResult<()>;

    /// Set hash fields. With `ttl`, the key's expiry is (re)set in the same step.
    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> KvResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<Bytes>>;

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, Bytes>>;

    async fn hash_len(&self, key: &str) -> KvResult<u64>;

    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()>;

    /// Current integer value, 0 when absent.
    async fn counter(&self, key: &str) -> KvResult<i64>;

    /// Increment a counter; the expiry is set only when the key has none, so
    /// the window is anchored at first use and never slides.
    async fn incr_within_window(&self, key: &str, by: i64, window: Duration) -> KvResult<i64>;

    async fn ttl(&self, key: &str) -> KvResult<Ttl>;

    async fn delete(&self, keys: &[String]) -> KvResult<()>;

    /// Keys matching a glob pattern (`*` wildcard only).
    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>>;

    /// Delete every key matching `pattern` that has no expiry. Returns the
    /// number of keys removed.
    async fn delete_persistent(&self, pattern: &str) -> KvResult<u64>;
}

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, Bytes>),
    Counter(i64),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store for single-node deployments and tests. Expired keys are
/// dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        Self::evict_expired(entries, key);
        entries.get_mut(key)
    }

    fn evict_expired(entries: &mut HashMap<String, Entry>, key: &str) {
        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
    }

    /// Testing hook: force a key to persist without expiry.
    #[cfg(test)]
    pub async fn persist(&self, key: &str) {
        if let Some(entry) = self.entries.lock().await.get_mut(key) {
            entry.expires_at = None;
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        let mut entries = self.entries.lock().await;
        Self::evict_expired(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(hash) = &mut entry.value else {
            return Err(KvError::WrongType(key.to_string()));
        };
        hash.extend(fields);
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<Bytes>> {
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, Bytes>> {
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hash_len(&self, key: &str) -> KvResult<u64> {
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key) {
            None => Ok(0),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.len() as u64),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()> {
        let mut entries = self.entries.lock().await;
        let now_empty = match Self::live(&mut entries, key) {
            None => return Ok(()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => {
                hash.remove(field);
                hash.is_empty()
            }
            Some(_) => return Err(KvError::WrongType(key.to_string())),
        };
        // Redis removes a hash once its last field is gone.
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn counter(&self, key: &str) -> KvResult<i64> {
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key) {
            None => Ok(0),
            Some(Entry {
                value: Value::Counter(value),
                ..
            }) => Ok(*value),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn incr_within_window(&self, key: &str, by: i64, window: Duration) -> KvResult<i64> {
        let mut entries = self.entries.lock().await;
        Self::evict_expired(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Counter(0),
            expires_at: None,
        });
        let Value::Counter(value) = &mut entry.value else {
            return Err(KvError::WrongType(key.to_string()));
        };
        *value += by;
        let current = *value;
        if entry.expires_at.is_none() {
            entry.expires_at = Some(Instant::now() + window);
        }
        Ok(current)
    }

    async fn ttl(&self, key: &str) -> KvResult<Ttl> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(match Self::live(&mut entries, key) {
            None => Ttl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => Ttl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => Ttl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn delete(&self, keys: &[String]) -> KvResult<()> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_persistent(&self, pattern: &str) -> KvResult<u64> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|key, entry| {
            entry.is_live(now) && !(entry.expires_at.is_none() && glob_match(pattern, key))
        });
        Ok((before - entries.len()) as u64)
    }
}

/// Match `key` against a pattern where `*` matches any run of characters.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}
