//! Append-only audit log.
//!
//! Every trust-relevant action lands in two capped lists: the acting
//! user's (`audit:user:<userId>`) and the global one (`audit:global`).
//! Both are trimmed on push so the KV store never accumulates unbounded
//! history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

/// One audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Entry id.
    pub id: String,
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Acting user.
    pub user_id: String,
    /// Action name, dotted (`webhook.created`, `session.blocked`).
    pub action: String,
    /// Structured detail.
    pub details: serde_json::Value,
}

/// Capped audit-log store.
pub struct AuditLogStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    cap: usize,
}

const GLOBAL_KEY: &str = "audit:global";

impl AuditLogStore {
    /// Create a store; each list keeps at most `cap` entries.
    pub fn new(kv: Arc<dyn KvStore>, cap: usize) -> Self {
        Self {
            kv,
            clock: Arc::new(SystemClock),
            cap: cap.max(1),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn user_key(user_id: &str) -> String {
        format!("audit:user:{}", user_id)
    }

    /// Append an action to the user's and the global log.
    pub async fn log(
        &self,
        user_id: &str,
        action: &str,
        details: serde_json::Value,
    ) -> CoreResult<AuditEntry> {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: self.clock.now(),
            user_id: user_id.to_string(),
            action: action.to_string(),
            details,
        };
        let raw = serde_json::to_string(&entry).map_err(|e| CoreError::Internal(e.to_string()))?;

        for key in [Self::user_key(user_id), GLOBAL_KEY.to_string()] {
            self.kv.rpush(&key, &[raw.clone()]).await?;
            self.kv.ltrim(&key, -(self.cap as i64), -1).await?;
        }
        Ok(entry)
    }

    /// Most recent entries for a user, oldest first.
    pub async fn recent_for_user(&self, user_id: &str, limit: usize) -> CoreResult<Vec<AuditEntry>> {
        self.read(&Self::user_key(user_id), limit).await
    }

    /// Most recent global entries, oldest first.
    pub async fn recent_global(&self, limit: usize) -> CoreResult<Vec<AuditEntry>> {
        self.read(GLOBAL_KEY, limit).await
    }

    async fn read(&self, key: &str, limit: usize) -> CoreResult<Vec<AuditEntry>> {
        let raw = self.kv.lrange(key, -(limit.max(1) as i64), -1).await?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
