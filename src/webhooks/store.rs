//! Webhook and delivery persistence over the KV store.
//!
//! Key namespaces (stable, shared with other processes):
//!
//! - `webhook:<id>`: webhook config, canonical JSON
//! - `webhook:user:<userId>`: set of webhook ids
//! - `webhook:event:<webhookId>:<eventId>`: publish-idempotency marker
//! - `delivery:<id>`: delivery record
//! - `delivery:queue:<userId>`: list of `<scheduledAtMillis>:<deliveryId>`
//! - `delivery:inflight`: global list of claimed delivery ids
//! - `delivery:claim:<id>:<attempt>`: CAS marker for one attempt
//! - `delivery:log:<webhookId>`: capped archive of terminal deliveries

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use super::signature::generate_secret;
use super::types::{
    Delivery, EventType, Webhook, WebhookOptions, WebhookStatus, WebhookTotals,
};
use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::util::{Clock, SystemClock};

// ============================================================================
// Webhook store
// ============================================================================

/// Inputs for creating a webhook.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    /// Owning user.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Destination URL.
    pub url: String,
    /// Subscribed event types.
    pub events: BTreeSet<EventType>,
    /// HMAC key; generated when absent.
    pub secret: Option<String>,
    /// Delivery tuning; defaults when absent.
    pub options: Option<WebhookOptions>,
}

/// CRUD and accounting for webhook configs.
pub struct WebhookStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    /// Consecutive failures at which a webhook auto-disables.
    failure_threshold: u32,
}

impl WebhookStore {
    /// Create a store with the configured failure threshold.
    pub fn new(kv: Arc<dyn KvStore>, failure_threshold: u32) -> Self {
        Self {
            kv,
            clock: Arc::new(SystemClock),
            failure_threshold,
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(id: &str) -> String {
        format!("webhook:{}", id)
    }

    fn user_key(user_id: &str) -> String {
        format!("webhook:user:{}", user_id)
    }

    /// Create and persist a webhook. URLs must parse; SSRF policy applies
    /// at delivery time against the then-current resolution.
    pub async fn create(&self, input: NewWebhook) -> CoreResult<Webhook> {
        crate::net::parse_url(&input.url)?;
        if input.events.is_empty() {
            return Err(CoreError::MalformedInput(
                "webhook must subscribe to at least one event".into(),
            ));
        }

        let now = self.clock.now();
        let webhook = Webhook {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id,
            name: input.name,
            description: input.description,
            url: input.url,
            secret: input.secret.unwrap_or_else(generate_secret),
            events: input.events,
            status: WebhookStatus::Active,
            created_at: now,
            updated_at: now,
            last_failure_at: None,
            totals: WebhookTotals::default(),
            options: input.options.unwrap_or_default(),
        };

        self.put(&webhook).await?;
        self.kv
            .sadd(&Self::user_key(&webhook.user_id), &[webhook.id.clone()])
            .await?;
        Ok(webhook)
    }

    /// Load one webhook.
    pub async fn get(&self, id: &str) -> CoreResult<Option<Webhook>> {
        match self.kv.get(&Self::key(id)).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::Internal(format!("corrupt webhook record: {}", e))),
        }
    }

    /// All webhooks owned by a user.
    pub async fn list_for_user(&self, user_id: &str) -> CoreResult<Vec<Webhook>> {
        let ids = self.kv.smembers(&Self::user_key(user_id)).await?;
        let mut hooks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(hook) = self.get(&id).await? {
                hooks.push(hook);
            }
        }
        hooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hooks)
    }

    /// Persist a modified webhook, bumping `updated_at`.
    pub async fn update(&self, webhook: &mut Webhook) -> CoreResult<()> {
        webhook.updated_at = self.clock.now();
        self.put(webhook).await
    }

    /// Delete a webhook and cascade its per-webhook state (archive list,
    /// membership). Delivery records age out via their own TTLs.
    pub async fn delete(&self, id: &str) -> CoreResult<bool> {
        let Some(webhook) = self.get(id).await? else {
            return Ok(false);
        };
        self.kv
            .srem(&Self::user_key(&webhook.user_id), &[id.to_string()])
            .await?;
        self.kv.delete(&format!("delivery:log:{}", id)).await?;
        self.kv.delete(&Self::key(id)).await?;
        Ok(true)
    }

    /// Re-enable a failed webhook (user action) and clear the failure
    /// streak.
    pub async fn reenable(&self, id: &str) -> CoreResult<Option<Webhook>> {
        let Some(mut webhook) = self.get(id).await? else {
            return Ok(None);
        };
        webhook.status = WebhookStatus::Active;
        webhook.totals.consecutive_failures = 0;
        self.update(&mut webhook).await?;
        Ok(Some(webhook))
    }

    /// Record a terminal success: totals bump, failure streak resets.
    pub async fn record_success(&self, id: &str) -> CoreResult<()> {
        if let Some(mut webhook) = self.get(id).await? {
            webhook.totals.delivered += 1;
            webhook.totals.succeeded += 1;
            webhook.totals.consecutive_failures = 0;
            self.update(&mut webhook).await?;
        }
        Ok(())
    }

    /// Record a terminal failure: totals bump, streak grows, and the
    /// webhook auto-disables at the threshold.
    pub async fn record_failure(&self, id: &str) -> CoreResult<Option<WebhookStatus>> {
        let Some(mut webhook) = self.get(id).await? else {
            return Ok(None);
        };
        webhook.totals.delivered += 1;
        webhook.totals.failed += 1;
        webhook.totals.consecutive_failures += 1;
        webhook.last_failure_at = Some(self.clock.now());
        if webhook.totals.consecutive_failures >= self.failure_threshold
            && webhook.status == WebhookStatus::Active
        {
            webhook.status = WebhookStatus::Failed;
        }
        self.update(&mut webhook).await?;
        Ok(Some(webhook.status))
    }

    async fn put(&self, webhook: &Webhook) -> CoreResult<()> {
        let raw =
            serde_json::to_string(webhook).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.kv.set(&Self::key(&webhook.id), &raw, None).await?;
        Ok(())
    }
}

// ============================================================================
// Delivery store
// ============================================================================

/// Retention for delivery records; terminal records age out.
const DELIVERY_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Retention for publish-idempotency markers.
pub(crate) const EVENT_MARKER_TTL_SECS: u64 = 24 * 60 * 60;

/// Persistence and queueing for deliveries.
pub struct DeliveryStore {
    kv: Arc<dyn KvStore>,
    /// Cap on the per-webhook terminal archive.
    archive_cap: usize,
}

impl DeliveryStore {
    /// Create a store with the configured archive cap.
    pub fn new(kv: Arc<dyn KvStore>, archive_cap: usize) -> Self {
        Self { kv, archive_cap }
    }

    fn key(id: &str) -> String {
        format!("delivery:{}", id)
    }

    fn queue_key(user_id: &str) -> String {
        format!("delivery:queue:{}", user_id)
    }

    fn queue_entry(scheduled_at: DateTime<Utc>, delivery_id: &str) -> String {
        format!("{}:{}", scheduled_at.timestamp_millis(), delivery_id)
    }

    const INFLIGHT_KEY: &'static str = "delivery:inflight";

    /// Persist a delivery record.
    pub async fn put(&self, delivery: &Delivery) -> CoreResult<()> {
        let raw =
            serde_json::to_string(delivery).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.kv
            .set(&Self::key(&delivery.id), &raw, Some(DELIVERY_TTL_SECS))
            .await?;
        Ok(())
    }

    /// Load a delivery record.
    pub async fn get(&self, id: &str) -> CoreResult<Option<Delivery>> {
        match self.kv.get(&Self::key(id)).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::Internal(format!("corrupt delivery record: {}", e))),
        }
    }

    /// Enqueue a delivery for its user at its scheduled time.
    pub async fn enqueue(&self, delivery: &Delivery) -> CoreResult<()> {
        self.kv
            .rpush(
                &Self::queue_key(&delivery.user_id),
                &[Self::queue_entry(delivery.scheduled_at, &delivery.id)],
            )
            .await?;
        Ok(())
    }

    /// Remove one queue entry.
    pub async fn dequeue(&self, user_id: &str, scheduled_at: DateTime<Utc>, id: &str) -> CoreResult<()> {
        self.kv
            .lrem(&Self::queue_key(user_id), 1, &Self::queue_entry(scheduled_at, id))
            .await?;
        Ok(())
    }

    /// Every user that currently has queued deliveries.
    pub async fn users_with_queues(&self) -> CoreResult<Vec<String>> {
        let keys = self.kv.keys("delivery:queue:*").await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix("delivery:queue:").map(str::to_string))
            .collect())
    }

    /// Queue entries for a user that are due at `now`, as
    /// `(scheduled_at, delivery_id)` sorted by schedule time.
    pub async fn due_entries(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<(DateTime<Utc>, String)>> {
        let raw = self.kv.lrange(&Self::queue_key(user_id), 0, -1).await?;
        let mut due = Vec::new();
        for entry in raw {
            let Some((millis, id)) = entry.split_once(':') else {
                continue;
            };
            let Ok(millis) = millis.parse::<i64>() else {
                continue;
            };
            let Some(scheduled_at) = Utc.timestamp_millis_opt(millis).single() else {
                continue;
            };
            if scheduled_at <= now {
                due.push((scheduled_at, id.to_string()));
            }
        }
        due.sort_by_key(|(at, _)| *at);
        Ok(due)
    }

    /// Claim one attempt of a delivery. Exactly one worker wins per
    /// `(delivery, attempt)`; the marker expires so a reaped delivery can
    /// be claimed again.
    pub async fn claim(&self, id: &str, attempt: u32, ttl_secs: u64) -> CoreResult<bool> {
        Ok(self
            .kv
            .set_nx(&format!("delivery:claim:{}:{}", id, attempt), "1", Some(ttl_secs))
            .await?)
    }

    /// Track a claimed delivery in the global in-flight list.
    pub async fn mark_inflight(&self, id: &str) -> CoreResult<()> {
        self.kv
            .rpush(Self::INFLIGHT_KEY, &[id.to_string()])
            .await?;
        Ok(())
    }

    /// Remove a delivery from the in-flight list.
    pub async fn clear_inflight(&self, id: &str) -> CoreResult<()> {
        self.kv.lrem(Self::INFLIGHT_KEY, 0, id).await?;
        Ok(())
    }

    /// Snapshot of in-flight delivery ids.
    pub async fn inflight(&self) -> CoreResult<Vec<String>> {
        Ok(self.kv.lrange(Self::INFLIGHT_KEY, 0, -1).await?)
    }

    /// Append a terminal delivery to its webhook's capped archive.
    pub async fn archive(&self, delivery: &Delivery) -> CoreResult<()> {
        let key = format!("delivery:log:{}", delivery.webhook_id);
        let raw =
            serde_json::to_string(delivery).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.kv.rpush(&key, &[raw]).await?;
        self.kv
            .ltrim(&key, -(self.archive_cap as i64), -1)
            .await?;
        Ok(())
    }

    /// Terminal archive for a webhook, oldest first.
    pub async fn archived(&self, webhook_id: &str) -> CoreResult<Vec<Delivery>> {
        let raw = self
            .kv
            .lrange(&format!("delivery:log:{}", webhook_id), 0, -1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    /// Publish-idempotency marker; returns whether this `(webhook, event)`
    /// pair is new.
    pub async fn mark_event(&self, webhook_id: &str, event_id: &str) -> CoreResult<bool> {
        Ok(self
            .kv
            .set_nx(
                &format!("webhook:event:{}:{}", webhook_id, event_id),
                "1",
                Some(EVENT_MARKER_TTL_SECS),
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::util::ManualClock;
    use chrono::Duration;

    fn new_hook(url: &str) -> NewWebhook {
        NewWebhook {
            user_id: "user-1".to_string(),
            name: "hook".to_string(),
            description: None,
            url: url.to_string(),
            events: [EventType::new("goal.completed")].into_iter().collect(),
            secret: None,
            options: None,
        }
    }

    fn delivery(id: &str, webhook_id: &str, at: DateTime<Utc>) -> Delivery {
        Delivery {
            id: id.to_string(),
            webhook_id: webhook_id.to_string(),
            event_id: "evt-1".to_string(),
            user_id: "user-1".to_string(),
            url: "https://receiver.test/hook".to_string(),
            payload: "{}".to_string(),
            signature: String::new(),
            status: super::super::types::DeliveryStatus::Pending,
            attempt: 1,
            max_attempts: 4,
            response_status: None,
            response_body: None,
            response_time_ms: None,
            created_at: at,
            scheduled_at: at,
            attempted_at: None,
            completed_at: None,
            error: None,
            error_code: None,
            attempt_log: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_generates_id_and_secret() {
        let store = WebhookStore::new(Arc::new(MemoryKv::new()), 20);
        let hook = store.create(new_hook("https://receiver.test/hook")).await.unwrap();
        assert_eq!(hook.secret.len(), 64);
        assert_eq!(hook.status, WebhookStatus::Active);

        let loaded = store.get(&hook.id).await.unwrap().unwrap();
        assert_eq!(loaded.url, hook.url);
        let listed = store.list_for_user("user-1").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_bad_urls_and_empty_events() {
        let store = WebhookStore::new(Arc::new(MemoryKv::new()), 20);
        assert!(store.create(new_hook("ftp://x.test/")).await.is_err());

        let mut input = new_hook("https://receiver.test/hook");
        input.events.clear();
        assert!(store.create(input).await.is_err());
    }

    #[tokio::test]
    async fn failure_streak_disables_at_threshold() {
        let store = WebhookStore::new(Arc::new(MemoryKv::new()), 3);
        let hook = store.create(new_hook("https://receiver.test/hook")).await.unwrap();

        assert_eq!(
            store.record_failure(&hook.id).await.unwrap(),
            Some(WebhookStatus::Active)
        );
        store.record_failure(&hook.id).await.unwrap();
        assert_eq!(
            store.record_failure(&hook.id).await.unwrap(),
            Some(WebhookStatus::Failed)
        );

        let loaded = store.get(&hook.id).await.unwrap().unwrap();
        assert_eq!(loaded.totals.consecutive_failures, 3);
        assert!(loaded.last_failure_at.is_some());

        // Success after re-enable clears the streak.
        store.reenable(&hook.id).await.unwrap();
        store.record_success(&hook.id).await.unwrap();
        let loaded = store.get(&hook.id).await.unwrap().unwrap();
        assert_eq!(loaded.totals.consecutive_failures, 0);
        assert_eq!(loaded.status, WebhookStatus::Active);
    }

    #[tokio::test]
    async fn delete_cascades() {
        let kv = Arc::new(MemoryKv::new());
        let store = WebhookStore::new(kv.clone(), 20);
        let deliveries = DeliveryStore::new(kv.clone(), 10);
        let hook = store.create(new_hook("https://receiver.test/hook")).await.unwrap();

        let now = Utc::now();
        let mut d = delivery("dl-1", &hook.id, now);
        d.status = super::super::types::DeliveryStatus::Delivered;
        deliveries.archive(&d).await.unwrap();
        assert_eq!(deliveries.archived(&hook.id).await.unwrap().len(), 1);

        assert!(store.delete(&hook.id).await.unwrap());
        assert!(store.get(&hook.id).await.unwrap().is_none());
        assert!(store.list_for_user("user-1").await.unwrap().is_empty());
        assert!(deliveries.archived(&hook.id).await.unwrap().is_empty());
        assert!(!store.delete(&hook.id).await.unwrap());
    }

    #[tokio::test]
    async fn queue_orders_by_schedule_time() {
        let clock = ManualClock::new(Utc::now());
        let kv = Arc::new(MemoryKv::with_clock(Arc::new(clock.clone())));
        let store = DeliveryStore::new(kv, 10);
        let base = clock.now();

        let later = delivery("dl-later", "wh", base + Duration::seconds(30));
        let sooner = delivery("dl-sooner", "wh", base);
        store.put(&later).await.unwrap();
        store.put(&sooner).await.unwrap();
        store.enqueue(&later).await.unwrap();
        store.enqueue(&sooner).await.unwrap();

        let due = store.due_entries("user-1", base).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, "dl-sooner");

        let due = store
            .due_entries("user-1", base + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(
            due.iter().map(|(_, id)| id.as_str()).collect::<Vec<_>>(),
            vec!["dl-sooner", "dl-later"]
        );

        store.dequeue("user-1", sooner.scheduled_at, &sooner.id).await.unwrap();
        let due = store
            .due_entries("user-1", base + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let store = DeliveryStore::new(Arc::new(MemoryKv::new()), 10);
        assert!(store.claim("dl-1", 1, 60).await.unwrap());
        assert!(!store.claim("dl-1", 1, 60).await.unwrap());
        // A different attempt is a different claim.
        assert!(store.claim("dl-1", 2, 60).await.unwrap());
    }

    #[tokio::test]
    async fn archive_is_capped() {
        let store = DeliveryStore::new(Arc::new(MemoryKv::new()), 3);
        let now = Utc::now();
        for i in 0..5 {
            let d = delivery(&format!("dl-{}", i), "wh-1", now);
            store.archive(&d).await.unwrap();
        }
        let archived = store.archived("wh-1").await.unwrap();
        assert_eq!(archived.len(), 3);
        assert_eq!(archived[0].id, "dl-2");
        assert_eq!(archived[2].id, "dl-4");
    }

    #[tokio::test]
    async fn event_markers_dedupe() {
        let store = DeliveryStore::new(Arc::new(MemoryKv::new()), 10);
        assert!(store.mark_event("wh-1", "evt-1").await.unwrap());
        assert!(!store.mark_event("wh-1", "evt-1").await.unwrap());
        assert!(store.mark_event("wh-2", "evt-1").await.unwrap());
    }

    #[tokio::test]
    async fn inflight_tracking() {
        let store = DeliveryStore::new(Arc::new(MemoryKv::new()), 10);
        store.mark_inflight("dl-1").await.unwrap();
        store.mark_inflight("dl-2").await.unwrap();
        assert_eq!(store.inflight().await.unwrap(), vec!["dl-1", "dl-2"]);
        store.clear_inflight("dl-1").await.unwrap();
        assert_eq!(store.inflight().await.unwrap(), vec!["dl-2"]);
    }

    #[tokio::test]
    async fn corrupt_records_surface_as_internal() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("webhook:bad", "{not json", None).await.unwrap();
        let store = WebhookStore::new(kv, 20);
        assert!(store.get("bad").await.is_err());
    }

    #[test]
    fn queue_entry_format() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        assert_eq!(
            DeliveryStore::queue_entry(at, "dl-9"),
            "1700000000000:dl-9"
        );
    }
}
