//! User block records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

/// Stored block record at `block:<userId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    /// Blocked user.
    pub user_id: String,
    /// Why the block was applied.
    pub reason: String,
    /// When it was applied.
    pub blocked_at: DateTime<Utc>,
    /// When it lapses.
    pub blocked_until: DateTime<Utc>,
}

/// Admission-gate view of a user's block state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    /// Whether the user is currently blocked.
    pub blocked: bool,
    /// Reason, when blocked.
    pub reason: Option<String>,
    /// Lapse time, when blocked.
    pub until: Option<DateTime<Utc>>,
}

impl BlockStatus {
    fn clear() -> Self {
        Self {
            blocked: false,
            reason: None,
            until: None,
        }
    }
}

/// Store for session-block decisions.
pub struct BlockStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl BlockStore {
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

    fn key(user_id: &str) -> String {
        format!("block:{}", user_id)
    }

    /// Block a user for `ttl_secs`.
    pub async fn block(&self, user_id: &str, reason: &str, ttl_secs: u64) -> CoreResult<BlockRecord> {
        let now = self.clock.now();
        let record = BlockRecord {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
            blocked_at: now,
            blocked_until: now + chrono::Duration::seconds(ttl_secs as i64),
        };
        let raw = serde_json::to_string(&record).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.kv.set(&Self::key(user_id), &raw, Some(ttl_secs)).await?;
        Ok(record)
    }

    /// Lift a block early. Returns whether one existed.
    pub async fn unblock(&self, user_id: &str) -> CoreResult<bool> {
        Ok(self.kv.delete(&Self::key(user_id)).await?)
    }

    /// Current block state; the TTL makes lapsed blocks read as clear.
    pub async fn is_blocked(&self, user_id: &str) -> CoreResult<BlockStatus> {
        let Some(raw) = self.kv.get(&Self::key(user_id)).await? else {
            return Ok(BlockStatus::clear());
        };
        let Ok(record) = serde_json::from_str::<BlockRecord>(&raw) else {
            return Ok(BlockStatus::clear());
        };
        if record.blocked_until <= self.clock.now() {
            return Ok(BlockStatus::clear());
        }
        Ok(BlockStatus {
            blocked: true,
            reason: Some(record.reason),
            until: Some(record.blocked_until),
        })
    }
}
