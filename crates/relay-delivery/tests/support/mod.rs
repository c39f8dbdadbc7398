//! Shared fixtures for delivery engine tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::{
    AccountId, Clock, Event, EventSource, EventType, Target, TargetId, TestClock,
};
use relay_delivery::client::{ClientConfig, DeliveryClient};
use relay_delivery::dispatcher::Dispatcher;
use relay_delivery::retry::RetryPolicy;
use relay_delivery::storage::mem::InMemoryStorage;
use relay_delivery::storage::EngineStorage;

/// A target subscribed to `message.inbound.received` with a small attempt
/// budget and a short timeout.
pub fn target(account_id: AccountId, url: &str) -> Target {
    let now = Utc::now();
    Target {
        id: TargetId::new(),
        account_id,
        url: url.to_string(),
        enabled: true,
        subscribed_events: vec![EventType::MessageInboundReceived],
        signing_secret: "whsec_test_secret".to_string(),
        max_attempts: 3,
        timeout_ms: 5_000,
        consecutive_failures: 0,
        last_delivery_at: None,
        last_success_at: None,
        last_failure_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

/// An inbound-message event with a small payload.
pub fn event(account_id: AccountId, dedupe_key: Option<&str>) -> Event {
    let now = Utc::now();
    Event::new(
        account_id,
        EventType::MessageInboundReceived,
        EventSource::Carrier,
        now,
        serde_json::json!({"from": "+15550001111", "body": "hello"}),
        dedupe_key.map(str::to_string),
        now,
    )
}

/// Dispatcher over an in-memory store with jitter-free backoff, so timing
/// assertions are exact.
pub fn dispatcher(storage: Arc<InMemoryStorage>, clock: Arc<TestClock>) -> Dispatcher {
    let retry_policy = RetryPolicy {
        jitter_window: Duration::ZERO,
        ..RetryPolicy::default()
    };
    let client = DeliveryClient::new(&ClientConfig::default()).expect("client build");
    Dispatcher::new(storage as Arc<dyn EngineStorage>, client, retry_policy, clock)
}

/// Plans a single pending delivery for an event/target pair via storage.
pub async fn plan_one(
    storage: &InMemoryStorage,
    event: &Event,
    target: &Target,
) -> relay_core::DeliveryId {
    plan_one_at(storage, event, target, Utc::now()).await
}

/// Like [`plan_one`] but with an explicit planning time, for ordering
/// assertions.
pub async fn plan_one_at(
    storage: &InMemoryStorage,
    event: &Event,
    target: &Target,
    planned_at: chrono::DateTime<Utc>,
) -> relay_core::DeliveryId {
    storage
        .create_event(event)
        .await
        .expect("event insert");
    let delivery = relay_core::Delivery::plan(event, target, planned_at);
    assert!(storage.create_delivery(&delivery).await.expect("delivery insert"));
    delivery.id
}

/// Test clock pinned to a fixed instant.
pub fn clock() -> Arc<TestClock> {
    use chrono::TimeZone;
    Arc::new(TestClock::starting_at(
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
    ))
}

/// Shorthand for `Arc<dyn Clock>` coercion in engine constructors.
pub fn as_clock(clock: Arc<TestClock>) -> Arc<dyn Clock> {
    clock
}
