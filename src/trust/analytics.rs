//! Buffered analytics events.
//!
//! Producers append into an in-memory buffer; the buffer flushes to a KV
//! list in batches. The contract: an event accepted into the buffer is
//! never lost. Hitting the hard cap flushes synchronously in the
//! producer's call, and a failed flush returns the batch to the front of
//! the buffer for the next attempt. Persistence may reorder across
//! batches, never within one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

const EVENTS_KEY: &str = "analytics:events";

/// One analytics event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    /// Event name, dotted.
    pub name: String,
    /// Acting user, when attributable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Free-form properties.
    pub properties: serde_json::Value,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

/// Capped in-memory buffer over a KV list.
pub struct EventBuffer {
    kv: Arc<dyn KvStore>,
    buffer: Mutex<Vec<AnalyticsEvent>>,
    cap: usize,
    clock: Arc<dyn Clock>,
}

impl EventBuffer {
    /// Create a buffer that force-flushes at `cap` events.
    pub fn new(kv: Arc<dyn KvStore>, cap: usize) -> Self {
        Self {
            kv,
            buffer: Mutex::new(Vec::new()),
            cap: cap.max(1),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Accept an event. When the buffer reaches the cap the producer pays
    /// for the flush.
    pub async fn record(
        &self,
        name: &str,
        user_id: Option<&str>,
        properties: serde_json::Value,
    ) -> CoreResult<()> {
        let event = AnalyticsEvent {
            name: name.to_string(),
            user_id: user_id.map(str::to_string),
            properties,
            timestamp: self.clock.now(),
        };

        let must_flush = {
            let mut buffer = self.buffer.lock();
            buffer.push(event);
            buffer.len() >= self.cap
        };
        if must_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Number of buffered, unflushed events.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Persist everything buffered. On failure the batch goes back to the
    /// head of the buffer; accepted events are never dropped.
    pub async fn flush(&self) -> CoreResult<usize> {
        let batch: Vec<AnalyticsEvent> = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut lines = Vec::with_capacity(batch.len());
        for event in &batch {
            lines.push(
                serde_json::to_string(event).map_err(|e| CoreError::Internal(e.to_string()))?,
            );
        }

        match self.kv.rpush(EVENTS_KEY, &lines).await {
            Ok(_) => Ok(batch.len()),
            Err(err) => {
                let mut buffer = self.buffer.lock();
                let mut restored = batch;
                restored.extend(buffer.drain(..));
                *buffer = restored;
                Err(err.into())
            }
        }
    }

    /// Read persisted events, oldest first (diagnostics and tests).
    pub async fn persisted(&self, limit: usize) -> CoreResult<Vec<AnalyticsEvent>> {
        let raw = self.kv.lrange(EVENTS_KEY, -(limit.max(1) as i64), -1).await?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    #[tokio::test]
    async fn cap_triggers_synchronous_flush() {
        let kv = Arc::new(MemoryKv::new());
        let buffer = EventBuffer::new(kv, 3);

        buffer.record("page.viewed", Some("u1"), json!({})).await.unwrap();
        buffer.record("goal.created", Some("u1"), json!({})).await.unwrap();
        assert_eq!(buffer.pending(), 2);

        buffer.record("goal.completed", Some("u1"), json!({})).await.unwrap();
        assert_eq!(buffer.pending(), 0);
        assert_eq!(buffer.persisted(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn explicit_flush_drains() {
        let kv = Arc::new(MemoryKv::new());
        let buffer = EventBuffer::new(kv, 100);
        buffer.record("a", None, json!({})).await.unwrap();
        buffer.record("b", None, json!({})).await.unwrap();

        assert_eq!(buffer.flush().await.unwrap(), 2);
        assert_eq!(buffer.pending(), 0);
        assert_eq!(buffer.flush().await.unwrap(), 0);

        let events = buffer.persisted(10).await.unwrap();
        assert_eq!(events[0].name, "a");
        assert_eq!(events[1].name, "b");
    }
}
