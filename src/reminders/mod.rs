//! # Reminder Scheduler
//!
//! The canonical consumer of the concurrency contract the KV store and
//! trust layer provide:
//!
//! - **Idempotency**: a send claims `reminder:idempotent:<id>` with
//!   set-if-absent before dispatching; a reminder is sent at most once no
//!   matter how many processors run.
//! - **Storm protection**: reminders overdue past the configured max age
//!   (plus grace) are skipped, and each user gets at most a few sends per
//!   batch.
//! - **Channel fallback**: channels are attempted in the fixed order
//!   push → email → sms, restricted to the reminder's enabled set; the
//!   first success wins, all-fail marks the reminder failed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RemindersConfig;
use crate::error::{CoreError, CoreResult};
use crate::kv::KvStore;
use crate::logging::{LogContext, Logger};
use crate::util::{Clock, SystemClock};

const PENDING_KEY: &str = "reminder:pending";
const IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

/// Notification channel, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderChannel {
    Push,
    Email,
    Sms,
}

/// The fixed fallback order.
pub const CHANNEL_ORDER: [ReminderChannel; 3] = [
    ReminderChannel::Push,
    ReminderChannel::Email,
    ReminderChannel::Sms,
];

/// Reminder lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Failed,
    /// Dropped by storm protection.
    Skipped,
}

/// One scheduled reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    /// Reminder id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Notification title.
    pub title: String,
    /// Optional body text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// When the reminder should fire.
    pub scheduled_at: DateTime<Utc>,
    /// Channels enabled for this reminder.
    pub channels: Vec<ReminderChannel>,
    /// Lifecycle status.
    pub status: ReminderStatus,
    /// Channel send attempts made.
    pub attempts: u32,
    /// Channel that delivered, when sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_via: Option<ReminderChannel>,
    /// Last failure cause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Delivery interface the scheduler dispatches through.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one reminder over one channel.
    async fn send(&self, channel: ReminderChannel, reminder: &Reminder) -> CoreResult<()>;
}

/// Counters for one processing batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Reminders delivered.
    pub sent: u64,
    /// Reminders that exhausted every channel.
    pub failed: u64,
    /// Dropped as too old.
    pub skipped_stale: u64,
    /// Already claimed by another processor.
    pub skipped_duplicate: u64,
    /// Deferred by the per-user batch cap.
    pub deferred: u64,
}

/// Scheduler over the KV store and an injected notifier.
pub struct ReminderScheduler {
    kv: Arc<dyn KvStore>,
    notifier: Arc<dyn Notifier>,
    config: RemindersConfig,
    logger: Logger,
    clock: Arc<dyn Clock>,
}

impl ReminderScheduler {
    /// Build a scheduler.
    pub fn new(
        kv: Arc<dyn KvStore>,
        notifier: Arc<dyn Notifier>,
        config: RemindersConfig,
        logger: &Logger,
    ) -> Self {
        Self {
            kv,
            notifier,
            config,
            logger: logger.child(LogContext::component("reminders")),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(id: &str) -> String {
        format!("reminder:{}", id)
    }

    fn idempotency_key(id: &str) -> String {
        format!("reminder:idempotent:{}", id)
    }

    /// Persist and enqueue a reminder.
    pub async fn schedule(&self, reminder: &Reminder) -> CoreResult<()> {
        if reminder.channels.is_empty() {
            return Err(CoreError::MalformedInput(
                "reminder has no enabled channels".into(),
            ));
        }
        self.put(reminder).await?;
        self.kv.rpush(PENDING_KEY, &[reminder.id.clone()]).await?;
        Ok(())
    }

    /// Load a reminder.
    pub async fn get(&self, id: &str) -> CoreResult<Option<Reminder>> {
        match self.kv.get(&Self::key(id)).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::Internal(format!("corrupt reminder record: {}", e))),
        }
    }

    /// Process every due reminder once. Safe to call from any number of
    /// processors concurrently; the idempotency claim keeps each send
    /// single-shot.
    pub async fn process_pending(&self) -> CoreResult<BatchSummary> {
        if !self.config.enabled {
            return Ok(BatchSummary::default());
        }

        let now = self.clock.now();
        let stale_after = Duration::seconds((self.config.max_age_secs + self.config.grace_secs) as i64);
        let ids = self.kv.lrange(PENDING_KEY, 0, -1).await?;

        let mut summary = BatchSummary::default();
        let mut per_user: HashMap<String, usize> = HashMap::new();

        for id in ids {
            let Some(mut reminder) = self.get(&id).await? else {
                self.kv.lrem(PENDING_KEY, 1, &id).await?;
                continue;
            };
            if reminder.status != ReminderStatus::Pending {
                self.kv.lrem(PENDING_KEY, 1, &id).await?;
                continue;
            }
            if reminder.scheduled_at > now {
                // Not due yet; stays queued.
                continue;
            }

            // Storm protection: too old to be worth waking the user for.
            if now - reminder.scheduled_at > stale_after {
                reminder.status = ReminderStatus::Skipped;
                reminder.last_error = Some("dropped as stale".to_string());
                self.put(&reminder).await?;
                self.kv.lrem(PENDING_KEY, 1, &id).await?;
                summary.skipped_stale += 1;
                continue;
            }

            // Storm protection: per-user per-batch send cap. Deferred
            // reminders stay queued without burning their claim.
            let sent_for_user = per_user.get(&reminder.user_id).copied().unwrap_or(0);
            if sent_for_user >= self.config.per_user_batch_cap {
                summary.deferred += 1;
                continue;
            }

            // Idempotency: claim before sending, at most one processor
            // dispatches this reminder within the claim window.
            if !self
                .kv
                .set_nx(&Self::idempotency_key(&id), "1", Some(IDEMPOTENCY_TTL_SECS))
                .await?
            {
                self.kv.lrem(PENDING_KEY, 1, &id).await?;
                summary.skipped_duplicate += 1;
                continue;
            }

            *per_user.entry(reminder.user_id.clone()).or_insert(0) += 1;
            self.dispatch(&mut reminder).await?;
            self.kv.lrem(PENDING_KEY, 1, &id).await?;
            match reminder.status {
                ReminderStatus::Sent => summary.sent += 1,
                _ => summary.failed += 1,
            }
        }

        Ok(summary)
    }

    /// Try each enabled channel in the fixed order; first success wins.
    async fn dispatch(&self, reminder: &mut Reminder) -> CoreResult<()> {
        let mut last_error = None;
        for channel in CHANNEL_ORDER {
            if !reminder.channels.contains(&channel) {
                continue;
            }
            reminder.attempts += 1;
            match self.notifier.send(channel, reminder).await {
                Ok(()) => {
                    reminder.status = ReminderStatus::Sent;
                    reminder.sent_via = Some(channel);
                    reminder.last_error = None;
                    self.put(reminder).await?;
                    self.logger.info(&format!(
                        "reminder {} sent via {:?}",
                        reminder.id, channel
                    ));
                    return Ok(());
                }
                Err(err) => {
                    self.logger.warn(&format!(
                        "reminder {} channel {:?} failed: {}",
                        reminder.id, channel, err
                    ));
                    last_error = Some(err.user_message());
                }
            }
        }

        reminder.status = ReminderStatus::Failed;
        reminder.last_error = last_error.or(Some("no enabled channel".to_string()));
        self.put(reminder).await?;
        Ok(())
    }

    async fn put(&self, reminder: &Reminder) -> CoreResult<()> {
        let raw =
            serde_json::to_string(reminder).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.kv.set(&Self::key(&reminder.id), &raw, None).await?;
        Ok(())
    }
}
