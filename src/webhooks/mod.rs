//! # Webhook Delivery Engine
//!
//! Outbound webhooks with signed payloads and at-least-once delivery:
//!
//! - **Subscriptions** (`types`, `store`): per-user webhooks with event
//!   filters, severity floors, and delivery tuning
//! - **Signing** (`signature`): canonical sorted-key JSON payloads signed
//!   with HMAC-SHA256, recomputed per attempt
//! - **Publication** (`dispatcher`): event fan-out with per-event
//!   idempotence
//! - **Delivery** (`delivery`): claimed attempts through the SSRF guard
//!   (redirects off), exponential backoff with full jitter, per-webhook
//!   ordering and fairness, failure-streak auto-disable, and a reaper for
//!   crashed workers
//!
//! Receivers verify `X-Nova-Signature` against the shared secret and may
//! deduplicate on `(webhookId, id)`; the payload id is stable across
//! retries.

pub mod delivery;
pub mod dispatcher;
pub mod signature;
pub mod store;
pub mod types;

pub use delivery::DeliveryEngine;
pub use dispatcher::WebhookDispatcher;
pub use signature::{generate_secret, sign, signed_payload, verify_payload};
pub use store::{DeliveryStore, NewWebhook, WebhookStore};
pub use types::{
    AttemptLogEntry, AttemptOutcome, Delivery, DeliveryStatus, EventCategory, EventSeverity,
    EventType, Webhook, WebhookEvent, WebhookOptions, WebhookStatus, WebhookTotals,
};
