//! Conversation session state.
//!
//! One KV hash per conversation at `session:<conversationId>`, with
//! per-field updates so concurrent writers do not clobber each other's
//! counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

/// A live conversation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Owning user.
    pub user_id: String,
    /// Conversation id (also the key).
    pub conversation_id: String,
    /// Messages exchanged.
    pub message_count: u64,
    /// Tokens consumed.
    pub token_count: u64,
    /// When the session opened.
    pub started_at: DateTime<Utc>,
    /// Last activity.
    pub last_activity_at: DateTime<Utc>,
}

/// Session persistence.
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
}

impl SessionStore {
    /// Create a store; sessions lapse after `ttl_secs` of inactivity.
    pub fn new(kv: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        Self {
            kv,
            clock: Arc::new(SystemClock),
            ttl_secs,
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(conversation_id: &str) -> String {
        format!("session:{}", conversation_id)
    }

    /// Open a session.
    pub async fn create(&self, user_id: &str, conversation_id: &str) -> CoreResult<Session> {
        let now = self.clock.now();
        let session = Session {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            message_count: 0,
            token_count: 0,
            started_at: now,
            last_activity_at: now,
        };
        let key = Self::key(conversation_id);
        self.kv.hset(&key, "userId", user_id).await?;
        self.kv.hset(&key, "conversationId", conversation_id).await?;
        self.kv.hset(&key, "messageCount", "0").await?;
        self.kv.hset(&key, "tokenCount", "0").await?;
        self.kv.hset(&key, "startedAt", &now.to_rfc3339()).await?;
        self.kv.hset(&key, "lastActivityAt", &now.to_rfc3339()).await?;
        self.kv.expire(&key, self.ttl_secs).await?;
        Ok(session)
    }

    /// Load a session.
    pub async fn get(&self, conversation_id: &str) -> CoreResult<Option<Session>> {
        let fields = self.kv.hgetall(&Self::key(conversation_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let parse_ts = |name: &str| -> CoreResult<DateTime<Utc>> {
            fields
                .get(name)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| CoreError::Internal(format!("corrupt session field {}", name)))
        };
        Ok(Some(Session {
            user_id: fields.get("userId").cloned().unwrap_or_default(),
            conversation_id: fields
                .get("conversationId")
                .cloned()
                .unwrap_or_else(|| conversation_id.to_string()),
            message_count: fields
                .get("messageCount")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            token_count: fields
                .get("tokenCount")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            started_at: parse_ts("startedAt")?,
            last_activity_at: parse_ts("lastActivityAt")?,
        }))
    }

    /// Record activity: bump counters, refresh `lastActivityAt`, extend the
    /// TTL.
    pub async fn record_activity(
        &self,
        conversation_id: &str,
        messages: u64,
        tokens: u64,
    ) -> CoreResult<Option<Session>> {
        let Some(mut session) = self.get(conversation_id).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        session.message_count += messages;
        session.token_count += tokens;
        session.last_activity_at = now;

        let key = Self::key(conversation_id);
        self.kv
            .hset(&key, "messageCount", &session.message_count.to_string())
            .await?;
        self.kv
            .hset(&key, "tokenCount", &session.token_count.to_string())
            .await?;
        self.kv
            .hset(&key, "lastActivityAt", &now.to_rfc3339())
            .await?;
        self.kv.expire(&key, self.ttl_secs).await?;
        Ok(Some(session))
    }

    /// Close a session.
    pub async fn delete(&self, conversation_id: &str) -> CoreResult<bool> {
        Ok(self.kv.delete(&Self::key(conversation_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::util::ManualClock;
    use chrono::{Duration, TimeZone};

    fn store() -> (SessionStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap());
        let kv = Arc::new(MemoryKv::with_clock(Arc::new(clock.clone())));
        (
            SessionStore::new(kv, 1800).with_clock(Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let (store, _) = store();
        let created = store.create("user-1", "conv-1").await.unwrap();
        let loaded = store.get("conv-1").await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(store.get("conv-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn activity_accumulates() {
        let (store, clock) = store();
        store.create("user-1", "conv-1").await.unwrap();

        clock.advance(Duration::minutes(5));
        store.record_activity("conv-1", 2, 340).await.unwrap();
        let session = store
            .record_activity("conv-1", 1, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.message_count, 3);
        assert_eq!(session.token_count, 440);
        assert!(session.last_activity_at > session.started_at);
    }

    #[tokio::test]
    async fn sessions_expire_without_activity() {
        let (store, clock) = store();
        store.create("user-1", "conv-1").await.unwrap();

        clock.advance(Duration::seconds(1801));
        assert!(store.get("conv-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn activity_extends_the_ttl() {
        let (store, clock) = store();
        store.create("user-1", "conv-1").await.unwrap();

        clock.advance(Duration::seconds(1500));
        store.record_activity("conv-1", 1, 10).await.unwrap();
        clock.advance(Duration::seconds(1500));
        assert!(store.get("conv-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_closes_the_session() {
        let (store, _) = store();
        store.create("user-1", "conv-1").await.unwrap();
        assert!(store.delete("conv-1").await.unwrap());
        assert!(!store.delete("conv-1").await.unwrap());
        assert!(store.get("conv-1").await.unwrap().is_none());
    }
}
