//! Webhook domain types.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Events
// ============================================================================

/// Event category, the dotted prefix of the event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Goal,
    Quest,
    Step,
    Spark,
    Memory,
    Chat,
    User,
    System,
}

/// Dotted event type string, e.g. `goal.completed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(pub String);

impl EventType {
    /// Construct from a dotted string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The category prefix; unknown prefixes fall into `System`.
    pub fn category(&self) -> EventCategory {
        match self.0.split('.').next().unwrap_or_default() {
            "goal" => EventCategory::Goal,
            "quest" => EventCategory::Quest,
            "step" => EventCategory::Step,
            "spark" => EventCategory::Spark,
            "memory" => EventCategory::Memory,
            "chat" => EventCategory::Chat,
            "user" => EventCategory::User,
            _ => EventCategory::System,
        }
    }

    /// The raw dotted name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event severity; webhooks can set a floor via `min_severity`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    #[default]
    Info,
    Warning,
    Critical,
}

/// A domain event offered to the webhook surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// Event id; publishing the same id twice enqueues at most once per
    /// subscribed webhook.
    pub id: String,

    /// Dotted event type.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Category, derived from the type prefix.
    pub category: EventCategory,

    /// Owning user.
    pub user_id: String,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// Event-specific payload.
    pub data: serde_json::Value,

    /// Producing subsystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Correlation id threaded from the originating request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Payload schema version.
    pub api_version: String,

    /// Emitting environment name.
    pub environment: String,

    /// Severity, compared against `min_severity`.
    #[serde(default)]
    pub severity: EventSeverity,
}

impl WebhookEvent {
    /// Build an event with its category derived and defaults filled.
    pub fn new(
        id: impl Into<String>,
        event_type: EventType,
        user_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        let category = event_type.category();
        Self {
            id: id.into(),
            event_type,
            category,
            user_id: user_id.into(),
            timestamp,
            data,
            source: None,
            correlation_id: None,
            api_version: "2024-11".to_string(),
            environment: "production".to_string(),
            severity: EventSeverity::Info,
        }
    }
}

// ============================================================================
// Webhooks
// ============================================================================

/// Webhook lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Receives deliveries.
    Active,
    /// Temporarily muted by the user.
    Paused,
    /// Turned off by the user.
    Disabled,
    /// Auto-disabled after too many consecutive failures; requires the user
    /// to re-enable.
    Failed,
}

/// Aggregate delivery accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTotals {
    /// Deliveries that reached a terminal state.
    pub delivered: u64,
    /// Terminal successes.
    pub succeeded: u64,
    /// Terminal failures.
    pub failed: u64,
    /// Failures since the last success; resets on success.
    pub consecutive_failures: u32,
}

/// Per-webhook delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOptions {
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    /// Base retry delay.
    pub retry_delay_ms: u64,
    /// Exponential backoff multiplier.
    pub retry_backoff_multiplier: f64,
    /// Per-attempt deadline.
    pub timeout_ms: u64,
    /// Extra headers sent on every delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_headers: Option<HashMap<String, String>>,
    /// Events below this severity are skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<EventSeverity>,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            retry_backoff_multiplier: 2.0,
            timeout_ms: 10_000,
            custom_headers: None,
            min_severity: None,
        }
    }
}

/// A user's webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    /// Webhook id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Destination URL; always fetched through the SSRF guard with
    /// redirects disabled.
    pub url: String,
    /// HMAC key, lowercase hex of at least 32 random bytes.
    pub secret: String,
    /// Subscribed event types.
    pub events: BTreeSet<EventType>,
    /// Lifecycle status.
    pub status: WebhookStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Last terminal failure, shown to the owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Accounting.
    pub totals: WebhookTotals,
    /// Delivery tuning.
    pub options: WebhookOptions,
}

impl Webhook {
    /// Whether this webhook should receive the event.
    pub fn accepts(&self, event: &WebhookEvent) -> bool {
        if self.status != WebhookStatus::Active {
            return false;
        }
        if !self.events.contains(&event.event_type) {
            return false;
        }
        if let Some(floor) = self.options.min_severity {
            if event.severity < floor {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Deliveries
// ============================================================================

/// Delivery lifecycle; transitions follow a CAS discipline
/// (`pending → in_progress → delivered | retrying | failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InProgress,
    Delivered,
    Failed,
    Retrying,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One row of the attempt log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptLogEntry {
    /// Attempt number, 1-based.
    pub attempt: u32,
    /// When the attempt completed.
    pub timestamp: DateTime<Utc>,
    /// Outcome.
    pub status: AttemptOutcome,
    /// HTTP status, when the receiver answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    /// Attempt latency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One attempt-sequence conveying one event to one webhook. Survives
/// retries as a single identity; the receiver sees the same `id` on every
/// attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    /// Delivery id (also the wire payload id).
    pub id: String,
    /// Target webhook.
    pub webhook_id: String,
    /// Source event.
    pub event_id: String,
    /// Owning user.
    pub user_id: String,
    /// Destination URL, snapshotted at enqueue time.
    pub url: String,
    /// Canonical JSON payload, signature included.
    pub payload: String,
    /// Current payload signature (recomputed when `attempt` increments).
    pub signature: String,
    /// Lifecycle status.
    pub status: DeliveryStatus,
    /// Current attempt number, 1-based.
    pub attempt: u32,
    /// Attempt ceiling (`1 + max_retries`).
    pub max_attempts: u32,
    /// Last HTTP status from the receiver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    /// Captured response body, capped for diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Last attempt latency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    /// When the delivery was created.
    pub created_at: DateTime<Utc>,
    /// When the current attempt becomes due.
    pub scheduled_at: DateTime<Utc>,
    /// When the last attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_at: Option<DateTime<Utc>>,
    /// When the delivery reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Terminal error classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// One entry per completed attempt.
    pub attempt_log: Vec<AttemptLogEntry>,
}

impl Delivery {
    /// Whether the delivery has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}
