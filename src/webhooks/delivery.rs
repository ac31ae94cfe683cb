//! Delivery engine.
//!
//! A worker loop that draws the oldest ready deliveries, claims each with a
//! CAS marker, and performs the HTTP attempt through the SSRF guard with
//! redirects disabled (webhook endpoints are exact):
//!
//! - Per webhook, attempts begin in `scheduled_at` order and at most K run
//!   simultaneously; different webhooks progress independently.
//! - Retries are strictly sequential per delivery: attempt N+1 is enqueued
//!   only after attempt N completes, at
//!   `retry_delay · multiplier^(attempt-1)` with full jitter.
//! - Failure streaks feed back into the webhook, which auto-disables at
//!   the configured threshold.
//! - A reaper reclaims deliveries stuck `in_progress` beyond twice the
//!   attempt timeout (crashed worker) back to `pending`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::{watch, Semaphore};

use super::signature::resign_for_attempt;
use super::store::{DeliveryStore, WebhookStore};
use super::types::{
    AttemptLogEntry, AttemptOutcome, Delivery, DeliveryStatus, Webhook, WebhookStatus,
};
use crate::config::WebhooksConfig;
use crate::error::CoreResult;
use crate::logging::{LogContext, Logger};
use crate::net::{GuardedClient, OutboundRequest};
use crate::util::{Clock, SystemClock};

/// Webhook delivery worker.
pub struct DeliveryEngine {
    webhooks: Arc<WebhookStore>,
    deliveries: Arc<DeliveryStore>,
    client: Arc<GuardedClient>,
    config: WebhooksConfig,
    /// Per-webhook fairness: at most K simultaneous in-progress deliveries.
    hook_slots: DashMap<String, Arc<Semaphore>>,
    logger: Logger,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Build an engine. The client must be composed over a guard whose
    /// policy disables redirects.
    pub fn new(
        webhooks: Arc<WebhookStore>,
        deliveries: Arc<DeliveryStore>,
        client: Arc<GuardedClient>,
        config: WebhooksConfig,
        logger: &Logger,
    ) -> Self {
        Self {
            webhooks,
            deliveries,
            client,
            config,
            hook_slots: DashMap::new(),
            logger: logger.child(LogContext::component("webhook-delivery")),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Worker loop: process due deliveries until shutdown flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticks: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.process_once().await {
                self.logger.warn(&format!("delivery pass failed: {}", err));
            }
            ticks += 1;
            if ticks % 60 == 0 {
                if let Err(err) = self.reap_stale().await {
                    self.logger.warn(&format!("reaper pass failed: {}", err));
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.logger.info("delivery engine stopped");
    }

    /// One pass: claim every due delivery and run the attempts. Attempts
    /// for the same webhook run sequentially in `scheduled_at` order;
    /// webhooks progress concurrently. Returns attempts performed.
    pub async fn process_once(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        let claim_ttl_secs = (2 * self.config.timeout_ms / 1000).max(1);

        // Claim phase: group claimed deliveries per webhook, keeping order.
        let mut per_hook: HashMap<String, Vec<Delivery>> = HashMap::new();
        for user_id in self.deliveries.users_with_queues().await? {
            for (scheduled_at, delivery_id) in
                self.deliveries.due_entries(&user_id, now).await?
            {
                let Some(delivery) = self.deliveries.get(&delivery_id).await? else {
                    // Record aged out; drop the queue entry.
                    self.deliveries.dequeue(&user_id, scheduled_at, &delivery_id).await?;
                    continue;
                };
                if !matches!(
                    delivery.status,
                    DeliveryStatus::Pending | DeliveryStatus::Retrying
                ) {
                    self.deliveries.dequeue(&user_id, scheduled_at, &delivery_id).await?;
                    continue;
                }
                if !self
                    .deliveries
                    .claim(&delivery.id, delivery.attempt, claim_ttl_secs)
                    .await?
                {
                    continue;
                }

                self.deliveries.dequeue(&user_id, scheduled_at, &delivery_id).await?;
                self.deliveries.mark_inflight(&delivery.id).await?;

                let mut claimed = delivery;
                claimed.status = DeliveryStatus::InProgress;
                claimed.attempted_at = Some(now);
                self.deliveries.put(&claimed).await?;

                per_hook
                    .entry(claimed.webhook_id.clone())
                    .or_default()
                    .push(claimed);
            }
        }

        // Attempt phase: sequential per webhook, concurrent across webhooks.
        let passes = per_hook.into_iter().map(|(webhook_id, batch)| {
            let slots = self.slots_for(&webhook_id);
            async move {
                let mut performed = 0usize;
                for delivery in batch {
                    let _permit = slots.acquire().await;
                    if let Err(err) = self.attempt(delivery).await {
                        self.logger.warn(&format!("attempt failed internally: {}", err));
                    }
                    performed += 1;
                }
                performed
            }
        });

        Ok(join_all(passes).await.into_iter().sum())
    }

    fn slots_for(&self, webhook_id: &str) -> Arc<Semaphore> {
        self.hook_slots
            .entry(webhook_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_webhook_concurrency)))
            .clone()
    }

    /// Perform one attempt and record its outcome.
    async fn attempt(&self, mut delivery: Delivery) -> CoreResult<()> {
        let webhook = self.webhooks.get(&delivery.webhook_id).await?;
        let Some(webhook) = webhook else {
            delivery.error = Some("webhook no longer exists".to_string());
            delivery.error_code = Some("WEBHOOK_DELETED".to_string());
            return self.finish_failed(delivery, None, None).await;
        };

        let started = Instant::now();
        let request = self.build_request(&delivery, &webhook);
        let result = self.client.fetch(&delivery.url, request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.is_success() => {
                self.finish_delivered(delivery, &webhook, response.status, &response.body, elapsed_ms)
                    .await
            }
            Ok(response) => {
                let body = truncate_capture(&response.body, self.config.response_capture_bytes);
                delivery.response_status = Some(response.status);
                delivery.response_body = Some(body);
                delivery.error = Some(format!("receiver returned {}", response.status));
                delivery.error_code = Some("PROVIDER_ERROR".to_string());
                self.retry_or_fail(delivery, &webhook, Some(response.status), elapsed_ms)
                    .await
            }
            Err(err) => {
                delivery.error = Some(err.user_message());
                delivery.error_code = Some(format!("{:?}", err.kind()));
                self.retry_or_fail(delivery, &webhook, None, elapsed_ms).await
            }
        }
    }

    fn build_request(&self, delivery: &Delivery, webhook: &Webhook) -> OutboundRequest {
        let event_name = serde_json::from_str::<serde_json::Value>(&delivery.payload)
            .ok()
            .and_then(|v| v.get("event").and_then(|e| e.as_str().map(str::to_string)))
            .unwrap_or_default();

        let mut request = OutboundRequest::post(delivery.payload.clone().into_bytes())
            .with_header("Content-Type", "application/json")
            .with_header("X-Nova-Signature", delivery.signature.clone())
            .with_header("X-Nova-Event", event_name)
            .with_header("X-Nova-Delivery", delivery.id.clone())
            .with_header("X-Nova-Webhook", delivery.webhook_id.clone())
            .with_header("X-Nova-Attempt", delivery.attempt.to_string());
        if let Some(custom) = &webhook.options.custom_headers {
            for (name, value) in custom {
                request = request.with_header(name.clone(), value.clone());
            }
        }
        request
    }

    async fn finish_delivered(
        &self,
        mut delivery: Delivery,
        _webhook: &Webhook,
        status: u16,
        body: &[u8],
        elapsed_ms: u64,
    ) -> CoreResult<()> {
        let now = self.clock.now();
        delivery.attempt_log.push(AttemptLogEntry {
            attempt: delivery.attempt,
            timestamp: now,
            status: AttemptOutcome::Success,
            response_status: Some(status),
            response_time_ms: Some(elapsed_ms),
            error: None,
        });
        delivery.status = DeliveryStatus::Delivered;
        delivery.response_status = Some(status);
        delivery.response_body = Some(truncate_capture(body, self.config.response_capture_bytes));
        delivery.response_time_ms = Some(elapsed_ms);
        delivery.completed_at = Some(now);
        delivery.error = None;
        delivery.error_code = None;

        self.deliveries.put(&delivery).await?;
        self.deliveries.clear_inflight(&delivery.id).await?;
        self.deliveries.archive(&delivery).await?;
        self.webhooks.record_success(&delivery.webhook_id).await?;

        self.logger.info(&format!(
            "delivery {} succeeded on attempt {}",
            delivery.id, delivery.attempt
        ));
        Ok(())
    }

    async fn retry_or_fail(
        &self,
        mut delivery: Delivery,
        webhook: &Webhook,
        response_status: Option<u16>,
        elapsed_ms: u64,
    ) -> CoreResult<()> {
        let now = self.clock.now();
        delivery.attempt_log.push(AttemptLogEntry {
            attempt: delivery.attempt,
            timestamp: now,
            status: AttemptOutcome::Failure,
            response_status,
            response_time_ms: Some(elapsed_ms),
            error: delivery.error.clone(),
        });
        delivery.response_time_ms = Some(elapsed_ms);

        if delivery.attempt < delivery.max_attempts {
            // Exponential backoff with full jitter.
            let exponent = (delivery.attempt - 1) as i32;
            let base_ms = (webhook.options.retry_delay_ms as f64
                * webhook.options.retry_backoff_multiplier.powi(exponent))
                as u64;
            let jitter_ms = rand::thread_rng().gen_range(0..=base_ms.max(1));

            delivery.attempt += 1;
            let (payload, signature) = resign_for_attempt(
                &delivery.payload,
                webhook.secret.as_bytes(),
                delivery.attempt,
            )?;
            delivery.payload = payload;
            delivery.signature = signature;
            delivery.status = DeliveryStatus::Retrying;
            delivery.scheduled_at = now + ChronoDuration::milliseconds(jitter_ms as i64);

            self.deliveries.put(&delivery).await?;
            self.deliveries.clear_inflight(&delivery.id).await?;
            self.deliveries.enqueue(&delivery).await?;

            self.logger.info(&format!(
                "delivery {} attempt {} failed, retry {} scheduled in {}ms",
                delivery.id,
                delivery.attempt - 1,
                delivery.attempt,
                jitter_ms
            ));
            Ok(())
        } else {
            self.finish_failed(delivery, response_status, Some(webhook)).await
        }
    }

    async fn finish_failed(
        &self,
        mut delivery: Delivery,
        response_status: Option<u16>,
        webhook: Option<&Webhook>,
    ) -> CoreResult<()> {
        let now = self.clock.now();
        delivery.status = DeliveryStatus::Failed;
        delivery.response_status = response_status.or(delivery.response_status);
        delivery.completed_at = Some(now);

        self.deliveries.put(&delivery).await?;
        self.deliveries.clear_inflight(&delivery.id).await?;
        self.deliveries.archive(&delivery).await?;

        if webhook.is_some() {
            let status = self.webhooks.record_failure(&delivery.webhook_id).await?;
            if status == Some(WebhookStatus::Failed) {
                self.logger.warn(&format!(
                    "webhook {} auto-disabled after repeated failures",
                    delivery.webhook_id
                ));
            }
        }

        self.logger.warn(&format!(
            "delivery {} failed terminally after {} attempts",
            delivery.id, delivery.attempt
        ));
        Ok(())
    }

    /// Reclaim deliveries stuck `in_progress` past `2 × timeout` (their
    /// worker died between claim and completion) back to `pending`.
    pub async fn reap_stale(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        let stale_after = ChronoDuration::milliseconds((2 * self.config.timeout_ms) as i64);
        let mut reclaimed = 0usize;

        for id in self.deliveries.inflight().await? {
            let Some(mut delivery) = self.deliveries.get(&id).await? else {
                self.deliveries.clear_inflight(&id).await?;
                continue;
            };
            if delivery.status != DeliveryStatus::InProgress {
                if delivery.is_terminal() {
                    self.deliveries.clear_inflight(&id).await?;
                }
                continue;
            }
            let stuck = delivery
                .attempted_at
                .map(|at| now - at > stale_after)
                .unwrap_or(true);
            if !stuck {
                continue;
            }

            delivery.status = DeliveryStatus::Pending;
            self.deliveries.put(&delivery).await?;
            self.deliveries.enqueue(&delivery).await?;
            self.deliveries.clear_inflight(&id).await?;
            reclaimed += 1;
            self.logger.warn(&format!("reclaimed stuck delivery {}", id));
        }
        Ok(reclaimed)
    }
}

/// Cap a response-body capture for diagnostics, lossily decoding UTF-8.
fn truncate_capture(body: &[u8], cap: usize) -> String {
    let slice = &body[..body.len().min(cap)];
    String::from_utf8_lossy(slice).into_owned()
}
