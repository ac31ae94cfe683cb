//! nova-cored - administrative daemon for the Nova trust and transport
//! core.
//!
//! Loads configuration from the environment, connects the key/value
//! backend, and runs the background machinery: the webhook delivery
//! engine, its reaper, and the reminder scheduler. The HTTP route layer
//! lives in a separate service; this binary is the core's operational
//! wrapper.
//!
//! Exit codes: `0` clean shutdown, `2` configuration error, `3` backend
//! unreachable, `4` signal-induced hard termination.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use nova_core::config::{CoreConfig, FetchConfig};
use nova_core::kv::{KvStore, MemoryKv, RedisKv};
use nova_core::logging::{LogFormat, Logger, LoggerConfig};
use nova_core::net::{
    CachingResolver, GuardedClient, SecureTransport, SsrfGuard, SystemResolver,
};
use nova_core::reminders::{Notifier, Reminder, ReminderChannel, ReminderScheduler};
use nova_core::webhooks::{DeliveryEngine, DeliveryStore, WebhookStore};
use nova_core::CoreResult;

const EXIT_CONFIG: u8 = 2;
const EXIT_BACKEND: u8 = 3;
const EXIT_SIGNAL: u8 = 4;

/// Placeholder notifier: the real push/email/sms providers live in the
/// notification service; the daemon logs what it would have dispatched.
struct LogNotifier {
    logger: Logger,
}

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, channel: ReminderChannel, reminder: &Reminder) -> CoreResult<()> {
        self.logger.info(&format!(
            "reminder {} for user {} dispatched via {:?}",
            reminder.id, reminder.user_id, channel
        ));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let logger = Logger::new(LoggerConfig {
        level: config.log.level,
        format: if config.environment.is_structured() {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        redact: config.log.redact,
    });
    logger.info(&format!("nova-cored {} starting", nova_core::VERSION));

    // Key/value backend: Redis when configured, in-memory otherwise.
    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => match RedisKv::connect(url).await {
            Ok(kv) => Arc::new(kv),
            Err(err) => {
                eprintln!("kv backend unreachable: {}", err);
                return ExitCode::from(EXIT_BACKEND);
            }
        },
        None => {
            logger.warn("REDIS_URL not set, using the in-memory kv backend");
            Arc::new(MemoryKv::new())
        }
    };
    if let Err(err) = kv.ping().await {
        eprintln!("kv backend unreachable: {}", err);
        return ExitCode::from(EXIT_BACKEND);
    }

    // Webhook endpoints are exact: same fetch policy, redirects off, the
    // per-attempt timeout from the webhook slice.
    let webhook_fetch = FetchConfig {
        allow_redirects: false,
        total_timeout_ms: config.webhooks.timeout_ms,
        ..config.fetch.clone()
    };
    let resolver = Arc::new(CachingResolver::new(
        Arc::new(SystemResolver::new(config.fetch.dns_timeout_ms)),
        kv.clone(),
        config.fetch.dns_cache_ttl_secs,
    ));
    let guard = Arc::new(SsrfGuard::new(webhook_fetch.clone(), resolver, &logger));
    let transport = Arc::new(SecureTransport::new(&webhook_fetch));
    let client = Arc::new(GuardedClient::new(guard, transport));

    let webhooks = Arc::new(WebhookStore::new(
        kv.clone(),
        config.webhooks.failure_threshold,
    ));
    let deliveries = Arc::new(DeliveryStore::new(kv.clone(), config.webhooks.archive_cap));
    let engine = Arc::new(DeliveryEngine::new(
        webhooks,
        deliveries,
        client,
        config.webhooks.clone(),
        &logger,
    ));

    let scheduler = Arc::new(ReminderScheduler::new(
        kv.clone(),
        Arc::new(LogNotifier {
            logger: logger.clone(),
        }),
        config.reminders.clone(),
        &logger,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_handle = tokio::spawn(engine.run(shutdown_rx.clone()));

    let reminder_logger = logger.clone();
    let mut reminder_shutdown = shutdown_rx;
    let reminder_handle = tokio::spawn(async move {
        loop {
            if *reminder_shutdown.borrow() {
                break;
            }
            if let Err(err) = scheduler.process_pending().await {
                reminder_logger.warn(&format!("reminder pass failed: {}", err));
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(15)) => {}
                _ = reminder_shutdown.changed() => {}
            }
        }
    });

    logger.info("nova-cored running, Ctrl-C to stop");

    if tokio::signal::ctrl_c().await.is_err() {
        eprintln!("signal handler failed");
        return ExitCode::from(EXIT_SIGNAL);
    }
    logger.info("shutdown requested, draining workers");
    let _ = shutdown_tx.send(true);

    // Graceful drain with a hard stop on a second signal.
    let drain = async {
        let _ = engine_handle.await;
        let _ = reminder_handle.await;
    };
    tokio::select! {
        _ = drain => {
            logger.info("clean shutdown");
            ExitCode::SUCCESS
        }
        _ = tokio::signal::ctrl_c() => {
            logger.warn("forced termination before drain completed");
            ExitCode::from(EXIT_SIGNAL)
        }
    }
}
