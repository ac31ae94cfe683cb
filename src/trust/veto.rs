//! Veto history.
//!
//! Counts safety vetoes per `(user, window)` so repeated vetoes within a
//! window can escalate to a block. Same bucketing as the rate limiter;
//! keys are `veto:<userId>:<bucket>` with the window as TTL.

use std::sync::Arc;

use crate::error::CoreResult;
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

/// Veto counter store.
pub struct VetoHistoryStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl VetoHistoryStore {
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

    fn key(&self, user_id: &str, window_secs: u64) -> String {
        let window = window_secs.max(1) as i64;
        let bucket = self.clock.now().timestamp().div_euclid(window);
        format!("veto:{}:{}", user_id, bucket)
    }

    /// Record a veto; returns the post-increment count for the window.
    pub async fn track(&self, user_id: &str, window_secs: u64) -> CoreResult<u64> {
        let key = self.key(user_id, window_secs);
        let count = self.kv.incr(&key).await? as u64;
        if count == 1 {
            self.kv.expire(&key, window_secs.max(1)).await?;
        }
        Ok(count)
    }

    /// Current count for the window without incrementing.
    pub async fn get_count(&self, user_id: &str, window_secs: u64) -> CoreResult<u64> {
        let key = self.key(user_id, window_secs);
        Ok(self
            .kv
            .get(&key)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }
}
