//! Event publication.
//!
//! `publish()` fans a domain event out to the owner's matching webhooks:
//! for each active subscription whose event set and severity floor admit
//! the event, it canonicalizes and signs the payload, creates a pending
//! [`Delivery`], and enqueues it. Re-publishing the same event id enqueues
//! at most once per webhook (marker-based idempotence).

use std::sync::Arc;

use uuid::Uuid;

use super::signature::{build_payload, signed_payload};
use super::store::{DeliveryStore, WebhookStore};
use super::types::{Delivery, DeliveryStatus, Webhook, WebhookEvent};
use crate::error::CoreResult;
use crate::logging::{LogContext, Logger};
use crate::util::{Clock, SystemClock};

/// Publishes events to subscribed webhooks.
pub struct WebhookDispatcher {
    webhooks: Arc<WebhookStore>,
    deliveries: Arc<DeliveryStore>,
    enabled: bool,
    logger: Logger,
    clock: Arc<dyn Clock>,
}

impl WebhookDispatcher {
    /// Build a dispatcher.
    pub fn new(
        webhooks: Arc<WebhookStore>,
        deliveries: Arc<DeliveryStore>,
        enabled: bool,
        logger: &Logger,
    ) -> Self {
        Self {
            webhooks,
            deliveries,
            enabled,
            logger: logger.child(LogContext::component("webhook-dispatcher")),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fan an event out. Returns the deliveries that were enqueued; an
    /// event nobody subscribes to returns an empty list, not an error.
    pub async fn publish(&self, event: &WebhookEvent) -> CoreResult<Vec<Delivery>> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let hooks = self.webhooks.list_for_user(&event.user_id).await?;
        let mut created = Vec::new();

        for hook in hooks {
            if !hook.accepts(event) {
                continue;
            }
            // At most one enqueue per (webhook, event id).
            if !self.deliveries.mark_event(&hook.id, &event.id).await? {
                self.logger.debug(&format!(
                    "event {} already enqueued for webhook {}",
                    event.id, hook.id
                ));
                continue;
            }

            let delivery = self.build_delivery(&hook, event)?;
            self.deliveries.put(&delivery).await?;
            self.deliveries.enqueue(&delivery).await?;
            self.logger.info(&format!(
                "enqueued delivery {} for webhook {} ({})",
                delivery.id, hook.id, event.event_type
            ));
            created.push(delivery);
        }

        Ok(created)
    }

    fn build_delivery(&self, hook: &Webhook, event: &WebhookEvent) -> CoreResult<Delivery> {
        let now = self.clock.now();
        let delivery_id = Uuid::new_v4().to_string();
        let unsigned = build_payload(
            &delivery_id,
            event.event_type.as_str(),
            event.timestamp,
            &event.data,
            &hook.id,
            &event.user_id,
            1,
        );
        let (payload, signature) = signed_payload(&unsigned, hook.secret.as_bytes())?;

        Ok(Delivery {
            id: delivery_id,
            webhook_id: hook.id.clone(),
            event_id: event.id.clone(),
            user_id: event.user_id.clone(),
            url: hook.url.clone(),
            payload,
            signature,
            status: DeliveryStatus::Pending,
            attempt: 1,
            max_attempts: 1 + hook.options.max_retries,
            response_status: None,
            response_body: None,
            response_time_ms: None,
            created_at: now,
            scheduled_at: now,
            attempted_at: None,
            completed_at: None,
            error: None,
            error_code: None,
            attempt_log: Vec::new(),
        })
    }
}
