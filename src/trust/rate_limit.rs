//! Rate-limit counters.
//!
//! Fixed windows over atomic KV counters: the bucket index is
//! `now / window`, the key is `rate:<subject>:<bucket>`, and the TTL set on
//! first increment retires the bucket. Counts within one window come back
//! in strict `1..N` order because the increment is atomic.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

/// Outcome of one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Post-increment count in the current window.
    pub count: u64,
    /// When the current window lapses.
    pub resets_at: DateTime<Utc>,
}

impl RateLimitStatus {
    /// Seconds until the window resets, floored at 1 for header use.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.resets_at - now).num_seconds().max(1) as u64
    }
}

/// Monotonic counter store for request admission.
pub struct RateLimitStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimitStore {
    /// Create a store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Atomically count one hit for `subject` in the current window.
    pub async fn increment(&self, subject: &str, window_secs: u64) -> CoreResult<RateLimitStatus> {
        let window = window_secs.max(1) as i64;
        let now = self.clock.now();
        let bucket = now.timestamp().div_euclid(window);
        let key = format!("rate:{}:{}", subject, bucket);

        let count = self.kv.incr(&key).await? as u64;
        if count == 1 {
            self.kv.expire(&key, window_secs.max(1)).await?;
        }

        let resets_at = Utc
            .timestamp_opt((bucket + 1) * window, 0)
            .single()
            .unwrap_or(now);
        Ok(RateLimitStatus { count, resets_at })
    }

    /// Count a hit and reject when the limit is exceeded; the error carries
    /// `retry_after` for the response header.
    pub async fn enforce(
        &self,
        subject: &str,
        window_secs: u64,
        limit: u64,
    ) -> CoreResult<RateLimitStatus> {
        let status = self.increment(subject, window_secs).await?;
        if status.count > limit {
            return Err(CoreError::RateLimited {
                retry_after_secs: status.retry_after_secs(self.clock.now()),
            });
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kv::MemoryKv;
    use crate::util::ManualClock;
    use chrono::Duration;

    fn store() -> (RateLimitStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());
        let kv = Arc::new(MemoryKv::with_clock(Arc::new(clock.clone())));
        (
            RateLimitStore::new(kv).with_clock(Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn counts_are_strictly_ordered() {
        let (store, _) = store();
        for expected in 1..=5u64 {
            let status = store.increment("user-1", 60).await.unwrap();
            assert_eq!(status.count, expected);
        }
    }

    #[tokio::test]
    async fn windows_roll_over() {
        let (store, clock) = store();
        assert_eq!(store.increment("u", 60).await.unwrap().count, 1);
        assert_eq!(store.increment("u", 60).await.unwrap().count, 2);

        clock.advance(Duration::seconds(61));
        assert_eq!(store.increment("u", 60).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn subjects_are_independent() {
        let (store, _) = store();
        store.increment("a", 60).await.unwrap();
        store.increment("a", 60).await.unwrap();
        assert_eq!(store.increment("b", 60).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn enforce_rejects_with_retry_after() {
        let (store, _) = store();
        store.enforce("u", 60, 2).await.unwrap();
        store.enforce("u", 60, 2).await.unwrap();
        let err = store.enforce("u", 60, 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        match err {
            CoreError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
