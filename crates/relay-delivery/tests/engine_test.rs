//! Worker-pool behavior: claiming, leases, and end-to-end delivery.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::{AccountId, Clock, DeliveryStatus, RealClock};
use relay_delivery::engine::{DeliveryEngine, EngineConfig};
use relay_delivery::storage::mem::InMemoryStorage;
use relay_delivery::storage::EngineStorage;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn engine_delivers_due_work_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let account = AccountId::new();
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let storage_dyn: Arc<dyn EngineStorage> = Arc::clone(&storage) as _;
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let mut engine = DeliveryEngine::new(storage_dyn, fast_config(), clock).unwrap();
    engine.start();

    let mut status = DeliveryStatus::Pending;
    for _ in 0..200 {
        status = storage.delivery(delivery_id).unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, DeliveryStatus::Succeeded);

    let stats = engine.stats();
    assert!(stats.succeeded.load(Ordering::Relaxed) >= 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn engine_retries_until_the_endpoint_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let account = AccountId::new();
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    // A tiny base delay keeps the retry observable within the test.
    let mut config = fast_config();
    config.retry_policy.base_delay = Duration::from_millis(10);
    config.retry_policy.jitter_window = Duration::from_millis(1);

    let storage_dyn: Arc<dyn EngineStorage> = Arc::clone(&storage) as _;
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let mut engine = DeliveryEngine::new(storage_dyn, config, clock).unwrap();
    engine.start();

    let mut delivery = storage.delivery(delivery_id).unwrap();
    for _ in 0..200 {
        delivery = storage.delivery(delivery_id).unwrap();
        if delivery.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.shutdown().await;

    assert_eq!(delivery.status, DeliveryStatus::Succeeded);
    assert_eq!(delivery.attempt_count, 2);
}

#[tokio::test]
async fn claims_hand_each_delivery_out_once() {
    let storage = InMemoryStorage::new();
    let account = AccountId::new();
    let target = support::target(account, "https://one.example/hook");
    storage.insert_target(target.clone());

    let e1 = support::event(account, None);
    let d1 = support::plan_one(&storage, &e1, &target).await;
    let e2 = support::event(account, None);
    let d2 = support::plan_one(&storage, &e2, &target).await;

    let now = Utc::now();
    let lease = now + chrono::Duration::minutes(2);

    let first = storage.claim_due_deliveries(1, now, lease).await.unwrap();
    let second = storage.claim_due_deliveries(1, now, lease).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first[0], second[0]);
    assert!([d1, d2].contains(&first[0]));
    assert!([d1, d2].contains(&second[0]));

    // Everything due is leased out now.
    let third = storage.claim_due_deliveries(10, now, lease).await.unwrap();
    assert!(third.is_empty());
}

#[tokio::test]
async fn expired_leases_make_deliveries_claimable_again() {
    let storage = InMemoryStorage::new();
    let account = AccountId::new();
    let target = support::target(account, "https://one.example/hook");
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let now = Utc::now();
    let lease = now + chrono::Duration::minutes(2);
    let claimed = storage.claim_due_deliveries(10, now, lease).await.unwrap();
    assert_eq!(claimed, vec![delivery_id]);

    // Still leased shortly after.
    let later = now + chrono::Duration::minutes(1);
    assert!(storage
        .claim_due_deliveries(10, later, lease)
        .await
        .unwrap()
        .is_empty());

    // Past the lease the claim has expired; the worker that held it is
    // presumed dead and the delivery resurfaces.
    let past_lease = now + chrono::Duration::minutes(3);
    let reclaimed = storage
        .claim_due_deliveries(10, past_lease, past_lease + chrono::Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(reclaimed, vec![delivery_id]);
}

#[tokio::test]
async fn terminal_deliveries_are_never_claimed() {
    let storage = InMemoryStorage::new();
    let account = AccountId::new();
    let target = support::target(account, "https://one.example/hook");
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let now = Utc::now();
    storage
        .mark_delivery_succeeded(delivery_id, 200, "ok", now)
        .await
        .unwrap();

    let claimed = storage
        .claim_due_deliveries(10, now + chrono::Duration::hours(24), now + chrono::Duration::hours(25))
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn shutdown_stops_an_idle_engine_quickly() {
    let storage: Arc<dyn EngineStorage> = Arc::new(InMemoryStorage::new());
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let mut engine = DeliveryEngine::new(storage, fast_config(), clock).unwrap();
    engine.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
        .await
        .expect("shutdown within the grace period");
}
