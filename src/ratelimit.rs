use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::UploadLimits;
use crate::error::{Error, Result};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaWindow {
    pub count: u64,
    /// Unix ms when the current window rolls over.
    pub reset: u64,
}

/// Keyed fixed-window counter. The production deployment points this at an
/// external key-value store with atomic increment-and-get; the in-process
/// backend below covers single-node setups and tests.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn incr(&self, key: &str, window: Duration) -> std::result::Result<QuotaWindow, QuotaError>;
}

#[derive(Default)]
pub struct MemoryQuotaStore {
    windows: Mutex<HashMap<String, (u64, u64)>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn incr(&self, key: &str, window: Duration) -> std::result::Result<QuotaWindow, QuotaError> {
        let now = now_ms();
        let window_ms = window.as_millis() as u64;
        let mut guard = self.windows.lock().await;
        let entry = guard.entry(key.to_string()).or_insert((now, 0));
        if now.saturating_sub(entry.0) >= window_ms {
            *entry = (now, 0);
        }
        entry.1 += 1;
        Ok(QuotaWindow {
            count: entry.1,
            reset: entry.0 + window_ms,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateStatus {
    pub remaining: u64,
    pub reset: u64,
}

/// Per-account upload quota. When the backing store is unreachable the
/// limiter is bypassed with a warning; the signature check remains the
/// primary defense.
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    max: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, limits: &UploadLimits) -> Self {
        Self {
            store,
            max: limits.max,
            window: Duration::from_millis(limits.duration),
        }
    }

    pub async fn check(&self, account: &str) -> Result<RateStatus> {
        match self.store.incr(account, self.window).await {
            Ok(window) => {
                if window.count > self.max {
                    Err(Error::QoutaExceeded {
                        reset: window.reset,
                    })
                } else {
                    Ok(RateStatus {
                        remaining: self.max - window.count,
                        reset: window.reset,
                    })
                }
            }
            Err(e) => {
                tracing::warn!(account, "rate limiter bypassed: {e}");
                Ok(RateStatus {
                    remaining: self.max,
                    reset: 0,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: u64) -> UploadLimits {
        UploadLimits {
            duration: 60_000,
            max,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn counts_down_then_rejects() {
        let limiter = RateLimiter::new(Arc::new(MemoryQuotaStore::new()), &limits(2));
        assert_eq!(limiter.check("alice").await.unwrap().remaining, 1);
        assert_eq!(limiter.check("alice").await.unwrap().remaining, 0);
        assert!(matches!(
            limiter.check("alice").await,
            Err(Error::QoutaExceeded { .. })
        ));
        // other accounts are unaffected
        assert_eq!(limiter.check("bob").await.unwrap().remaining, 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl QuotaStore for BrokenStore {
        async fn incr(
            &self,
            _key: &str,
            _window: Duration,
        ) -> std::result::Result<QuotaWindow, QuotaError> {
            Err(QuotaError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn bypasses_on_store_failure() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), &limits(2));
        let status = limiter.check("alice").await.unwrap();
        assert_eq!(status.remaining, 2);
    }

    #[tokio::test]
    async fn window_resets() {
        let store = MemoryQuotaStore::new();
        let tiny = Duration::from_millis(1);
        store.incr("a", tiny).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let window = store.incr("a", tiny).await.unwrap();
        assert_eq!(window.count, 1);
    }
}
