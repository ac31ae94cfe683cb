//! End-to-end scenarios for webhook delivery and the trust stores.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use nova_core::config::{FetchConfig, WebhooksConfig};
use nova_core::kv::{KvStore, MemoryKv};
use nova_core::logging::{Logger, LoggerConfig, MemorySink};
use nova_core::net::{GuardedClient, ScriptedTransport, SsrfGuard, StaticResolver};
use nova_core::trust::{AckTokenStore, RateLimitStore};
use nova_core::util::{Clock, ManualClock};
use nova_core::webhooks::{
    verify_payload, DeliveryEngine, DeliveryStatus, DeliveryStore, EventType, NewWebhook,
    WebhookDispatcher, WebhookEvent, WebhookStore,
};

fn quiet_logger() -> Logger {
    Logger::with_sink(LoggerConfig::default(), Arc::new(MemorySink::new()))
}

struct Rig {
    clock: ManualClock,
    kv: Arc<MemoryKv>,
    webhooks: Arc<WebhookStore>,
    deliveries: Arc<DeliveryStore>,
    dispatcher: WebhookDispatcher,
    engine: Arc<DeliveryEngine>,
    transport: Arc<ScriptedTransport>,
}

fn rig() -> Rig {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 8, 1, 8, 0, 0).unwrap());
    let kv = Arc::new(MemoryKv::with_clock(Arc::new(clock.clone())));
    let logger = quiet_logger();
    let config = WebhooksConfig::default();

    let webhooks = Arc::new(
        WebhookStore::new(kv.clone(), config.failure_threshold)
            .with_clock(Arc::new(clock.clone())),
    );
    let deliveries = Arc::new(DeliveryStore::new(kv.clone(), config.archive_cap));

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("receiver.test", vec!["93.184.216.34".parse().unwrap()]);
    let guard = Arc::new(SsrfGuard::new(
        FetchConfig {
            enabled: true,
            allow_redirects: false,
            ..FetchConfig::default()
        },
        resolver,
        &logger,
    ));
    let transport = Arc::new(ScriptedTransport::new());
    let client = Arc::new(GuardedClient::new(guard, transport.clone()));

    let dispatcher = WebhookDispatcher::new(webhooks.clone(), deliveries.clone(), true, &logger)
        .with_clock(Arc::new(clock.clone()));
    let engine = Arc::new(
        DeliveryEngine::new(
            webhooks.clone(),
            deliveries.clone(),
            client,
            config,
            &logger,
        )
        .with_clock(Arc::new(clock.clone())),
    );

    Rig {
        clock,
        kv,
        webhooks,
        deliveries,
        dispatcher,
        engine,
        transport,
    }
}

async fn subscribe(rig: &Rig, events: &[&str]) -> nova_core::webhooks::Webhook {
    rig.webhooks
        .create(NewWebhook {
            user_id: "user-1".to_string(),
            name: "integration hook".to_string(),
            description: None,
            url: "https://receiver.test/hook".to_string(),
            events: events.iter().map(|e| EventType::new(*e)).collect(),
            secret: None,
            options: None,
        })
        .await
        .unwrap()
}

/// Receiver returns 500, 500, then 200: delivered on attempt 3, three
/// attempt-log entries, verified signatures throughout, streak reset.
#[tokio::test]
async fn webhook_delivery_with_retries() {
    let rig = rig();
    let hook = subscribe(&rig, &["goal.completed"]).await;

    rig.transport.push_response(500, b"downstream failure");
    rig.transport.push_response(500, b"still broken");
    rig.transport.push_response(200, b"accepted");

    let event = WebhookEvent::new(
        "evt-1",
        EventType::new("goal.completed"),
        "user-1",
        rig.clock.now(),
        json!({"goalId": "g-42", "title": "finish the report"}),
    );
    let created = rig.dispatcher.publish(&event).await.unwrap();
    assert_eq!(created.len(), 1);
    let id = created[0].id.clone();

    // Attempt 1 (fails), then advance past each backoff window: base
    // delays are 1s and 2s, jitter only shortens them.
    rig.engine.process_once().await.unwrap();
    rig.clock.advance(Duration::milliseconds(1_001));
    rig.engine.process_once().await.unwrap();
    rig.clock.advance(Duration::milliseconds(2_001));
    rig.engine.process_once().await.unwrap();

    let delivery = rig.deliveries.get(&id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempt, 3);
    assert_eq!(delivery.attempt_log.len(), 3);
    assert!(delivery.attempt_log[0].error.is_some());
    assert_eq!(delivery.attempt_log[2].response_status, Some(200));

    // Every wire payload carried a valid signature and the same id.
    for (_, request) in rig.transport.executed() {
        let body = String::from_utf8(request.body.unwrap()).unwrap();
        assert!(verify_payload(&body, hook.secret.as_bytes()));
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["id"], id.as_str());
    }

    let hook_after = rig.webhooks.get(&hook.id).await.unwrap().unwrap();
    assert_eq!(hook_after.totals.consecutive_failures, 0);
    assert_eq!(hook_after.totals.succeeded, 1);
}

/// Publishing the same event id twice enqueues at most one delivery per
/// webhook.
#[tokio::test]
async fn publish_is_idempotent() {
    let rig = rig();
    subscribe(&rig, &["goal.completed"]).await;

    let event = WebhookEvent::new(
        "evt-same",
        EventType::new("goal.completed"),
        "user-1",
        rig.clock.now(),
        json!({}),
    );
    assert_eq!(rig.dispatcher.publish(&event).await.unwrap().len(), 1);
    assert_eq!(rig.dispatcher.publish(&event).await.unwrap().len(), 0);
    assert_eq!(rig.dispatcher.publish(&event).await.unwrap().len(), 0);
}

/// Once a webhook's failure streak crosses the threshold it flips to
/// failed and publish stops enqueueing for it.
#[tokio::test]
async fn failing_webhook_is_auto_disabled() {
    let rig = rig();
    let hook = subscribe(&rig, &["goal.completed"]).await;
    rig.transport.push_response(500, b"never healthy");

    // Drive 20 events to terminal failure (4 attempts each).
    for round in 0..20 {
        let event = WebhookEvent::new(
            format!("evt-{}", round),
            EventType::new("goal.completed"),
            "user-1",
            rig.clock.now(),
            json!({}),
        );
        rig.dispatcher.publish(&event).await.unwrap();
        for _ in 0..4 {
            rig.engine.process_once().await.unwrap();
            rig.clock.advance(Duration::seconds(10));
        }
    }

    let hook_after = rig.webhooks.get(&hook.id).await.unwrap().unwrap();
    assert_eq!(
        hook_after.status,
        nova_core::webhooks::WebhookStatus::Failed
    );
    assert!(hook_after.totals.consecutive_failures >= 20);

    // No new deliveries for a failed webhook.
    let event = WebhookEvent::new(
        "evt-after-disable",
        EventType::new("goal.completed"),
        "user-1",
        rig.clock.now(),
        json!({}),
    );
    assert!(rig.dispatcher.publish(&event).await.unwrap().is_empty());
}

/// One of two concurrent validators wins; the key is
/// gone afterwards.
#[tokio::test]
async fn single_use_ack_token_race() {
    let kv = Arc::new(MemoryKv::new());
    let store = Arc::new(AckTokenStore::new(kv.clone()));
    store.save("tok1", "userA", 60).await.unwrap();

    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.validate("tok1", "userA").await.unwrap() })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.validate("tok1", "userA").await.unwrap() })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert!(a ^ b, "exactly one validator wins, got {} and {}", a, b);
    assert!(!kv.exists("ack:tok1").await.unwrap());
}

/// Rate-limit counts come back in strict order within a window.
#[tokio::test]
async fn rate_limit_counts_strictly() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap());
    let kv = Arc::new(MemoryKv::with_clock(Arc::new(clock.clone())));
    let store = RateLimitStore::new(kv).with_clock(Arc::new(clock.clone()));

    for expected in 1..=10u64 {
        assert_eq!(store.increment("subject", 60).await.unwrap().count, expected);
    }
    clock.advance(Duration::seconds(61));
    assert_eq!(store.increment("subject", 60).await.unwrap().count, 1);
}

/// KV boundary behaviors the delivery machinery leans on.
#[tokio::test]
async fn kv_boundary_behaviors() {
    let rig = rig();

    // incr initializes and conflicts on non-integers.
    assert_eq!(rig.kv.incr("counter").await.unwrap(), 1);
    rig.kv.set("text", "hello", None).await.unwrap();
    assert!(rig.kv.incr("text").await.is_err());

    // Shape mismatch is an error, not an absence.
    rig.kv.rpush("list", &["x".to_string()]).await.unwrap();
    assert!(rig.kv.get("list").await.is_err());
    assert!(rig.kv.exists("list").await.unwrap());
}
