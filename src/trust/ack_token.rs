//! Single-use acknowledgement tokens.
//!
//! A token is saved with a TTL and consumed exactly once: validation reads
//! and deletes atomically (`take`), so among concurrent validators exactly
//! one sees the record. A probe with the wrong user also consumes the
//! token; the atomic read-and-delete cannot peek first, and burning on a
//! bad guess closes the probing oracle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRecord {
    user_id: String,
    expires_at: DateTime<Utc>,
}

/// Store for single-use acknowledgement tokens.
pub struct AckTokenStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl AckTokenStore {
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

    fn key(token: &str) -> String {
        format!("ack:{}", token)
    }

    /// Save a token for a user with a TTL in seconds.
    pub async fn save(&self, token: &str, user_id: &str, ttl_secs: u64) -> CoreResult<()> {
        let record = AckRecord {
            user_id: user_id.to_string(),
            expires_at: self.clock.now() + chrono::Duration::seconds(ttl_secs as i64),
        };
        let raw = serde_json::to_string(&record).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.kv.set(&Self::key(token), &raw, Some(ttl_secs)).await?;
        Ok(())
    }

    /// Consume a token. True exactly once, and only for the matching user
    /// before expiry.
    pub async fn validate(&self, token: &str, user_id: &str) -> CoreResult<bool> {
        let Some(raw) = self.kv.take(&Self::key(token)).await? else {
            return Ok(false);
        };
        let Ok(record) = serde_json::from_str::<AckRecord>(&raw) else {
            return Ok(false);
        };
        Ok(record.user_id == user_id && record.expires_at > self.clock.now())
    }
}
