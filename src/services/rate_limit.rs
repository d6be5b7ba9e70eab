//! src/services/rate_limit.rs
//!
//! Per-IP upload byte budget over a window anchored at first use.
//!
//! `can_upload` is advisory and does not reserve anything; callers track
//! usage separately once the work succeeded. Two concurrent requests from one
//! IP can therefore both pass the check and jointly exceed the budget. That
//! is accepted for a soft quota.

use super::{error::TransferResult, kv::KvStore, kv::Ttl};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::debug;

const KEY_PREFIX: &str = "upload_limit:";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn limit_key(ip: &str) -> String {
    format!("{KEY_PREFIX}{ip}")
}

/// Outcome of a quota check.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LimitCheck {
    pub allowed: bool,
    pub remaining_bytes: u64,
    /// Seconds until the window resets; 0 when the IP has no usage yet.
    pub reset_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    limit_bytes: u64,
    window: Duration,
}

impl RateLimiter {
    /// A `limit_bytes` of zero disables the budget.
    pub fn new(kv: Arc<dyn KvStore>, limit_bytes: u64, window: Duration) -> Self {
        Self {
            kv,
            limit_bytes,
            window,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit_bytes > 0
    }

    /// Would `file_size` more bytes fit in the IP's remaining budget?
    pub async fn can_upload(&self, ip: &str, file_size: u64) -> TransferResult<LimitCheck> {
        if !self.is_enabled() {
            return Ok(LimitCheck {
                allowed: true,
                remaining_bytes: u64::MAX,
                reset_in: 0,
                message: None,
            });
        }

        let key = limit_key(ip);
        let used = self.kv.counter(&key).await?.max(0) as u64;
        let remaining = self.limit_bytes.saturating_sub(used);
        let reset_in = match self.kv.ttl(&key).await? {
            Ttl::Expires(left) => left.as_secs(),
            Ttl::Missing | Ttl::Persistent => 0,
        };

        let allowed = file_size <= remaining;
        let message = (!allowed).then(|| {
            format!(
                "File exceeds the available upload space. You have {:.2} MB available",
                remaining as f64 / BYTES_PER_MB
            )
        });
        Ok(LimitCheck {
            allowed,
            remaining_bytes: remaining,
            reset_in,
            message,
        })
    }

    /// Add `bytes` to the IP's usage. The first write opens the window;
    /// later writes never move it. Returns the new total.
    pub async fn track_usage(&self, ip: &str, bytes: u64) -> TransferResult<u64> {
        let by = i64::try_from(bytes).unwrap_or(i64::MAX);
        let total = self
            .kv
            .incr_within_window(&limit_key(ip), by, self.window)
            .await?;
        debug!("upload usage for {} is now {} bytes", ip, total);
        Ok(total.max(0) as u64)
    }

    /// Forget an IP's usage.
    pub async fn invalidate(&self, ip: &str) -> TransferResult<()> {
        self.kv.delete(&[limit_key(ip)]).await?;
        Ok(())
    }

    /// Remove counters left without an expiry.
    pub async fn clean_orphaned_records(&self) -> TransferResult<u64> {
        Ok(self
            .kv
            .delete_persistent(&format!("{KEY_PREFIX}*"))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::kv::MemoryKv;

    const MB: u64 = 1024 * 1024;

    fn limiter(kv: Arc<MemoryKv>, limit: u64) -> RateLimiter {
        RateLimiter::new(kv, limit, Duration::from_secs(86_400))
    }

    #[tokio::test]
    async fn fresh_ip_has_full_budget_and_no_reset() {
        let limiter = limiter(Arc::new(MemoryKv::new()), 10 * MB);
        let check = limiter.can_upload("10.0.0.1", MB).await.unwrap();
        assert_eq!(
            check,
            LimitCheck {
                allowed: true,
                remaining_bytes: 10 * MB,
                reset_in: 0,
                message: None,
            }
        );
    }

    #[tokio::test]
    async fn boundary_is_inclusive_of_remaining() {
        let limiter = limiter(Arc::new(MemoryKv::new()), 10 * MB);
        limiter.track_usage("10.0.0.1", 4 * MB).await.unwrap();

        let remaining = 6 * MB;
        let exact = limiter.can_upload("10.0.0.1", remaining).await.unwrap();
        assert!(exact.allowed);
        assert_eq!(exact.remaining_bytes, remaining);
        assert!(exact.reset_in > 86_000);

        let over = limiter.can_upload("10.0.0.1", remaining + 1).await.unwrap();
        assert!(!over.allowed);
        assert_eq!(
            over.message.as_deref(),
            Some("File exceeds the available upload space. You have 6.00 MB available")
        );
    }

    #[tokio::test]
    async fn check_does_not_consume_budget() {
        let limiter = limiter(Arc::new(MemoryKv::new()), MB);
        for _ in 0..3 {
            assert!(limiter.can_upload("ip", MB).await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn remaining_is_clamped_when_over_budget() {
        let limiter = limiter(Arc::new(MemoryKv::new()), MB);
        assert_eq!(limiter.track_usage("ip", 3 * MB).await.unwrap(), 3 * MB);
        let check = limiter.can_upload("ip", 1).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.remaining_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_opens_at_first_use_and_then_resets() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = RateLimiter::new(kv, MB, Duration::from_secs(100));
        limiter.track_usage("ip", MB).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        limiter.track_usage("ip", 1).await.unwrap();
        assert_eq!(limiter.can_upload("ip", 1).await.unwrap().reset_in, 40);

        tokio::time::advance(Duration::from_secs(41)).await;
        let check = limiter.can_upload("ip", MB).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.reset_in, 0);
    }

    #[tokio::test]
    async fn invalidate_and_orphan_cleanup() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = limiter(kv.clone(), MB);
        limiter.track_usage("a", MB).await.unwrap();
        limiter.track_usage("b", MB).await.unwrap();
        limiter.track_usage("c", MB).await.unwrap();

        limiter.invalidate("a").await.unwrap();
        assert!(limiter.can_upload("a", MB).await.unwrap().allowed);

        kv.persist("upload_limit:b").await;
        assert_eq!(limiter.clean_orphaned_records().await.unwrap(), 1);
        assert!(limiter.can_upload("b", MB).await.unwrap().allowed);
        assert!(!limiter.can_upload("c", MB).await.unwrap().allowed);
        assert_eq!(limiter.clean_orphaned_records().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_budget_allows_everything() {
        let limiter = limiter(Arc::new(MemoryKv::new()), 0);
        assert!(!limiter.is_enabled());
        assert!(limiter.can_upload("ip", u64::MAX).await.unwrap().allowed);
    }
}
