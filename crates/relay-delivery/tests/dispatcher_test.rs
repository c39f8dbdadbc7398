//! Dispatch behavior against a live HTTP test server.

mod support;

use std::sync::Arc;
use std::time::Duration;

use relay_core::{AccountId, Clock, DeliveryStatus};
use relay_delivery::dispatcher::DispatchOutcome;
use relay_delivery::signing;
use relay_delivery::storage::mem::InMemoryStorage;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn http_200_marks_the_delivery_succeeded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, &format!("{}/hooks", server.uri()));
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), Arc::clone(&clock));
    let outcome = dispatcher.dispatch(delivery_id).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Succeeded);

    let delivery = storage.delivery(delivery_id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Succeeded);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.last_status_code, Some(200));
    assert_eq!(delivery.last_response_snippet.as_deref(), Some("accepted"));
    assert!(delivery.delivered_at.is_some());
    assert!(delivery.next_attempt_at.is_none());
    assert!(delivery.last_error.is_none());

    let target = storage.target(target.id).unwrap();
    assert_eq!(target.consecutive_failures, 0);
    assert!(target.last_success_at.is_some());
    assert!(target.last_error.is_none());
}

#[tokio::test]
async fn non_200_success_codes_are_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), clock);
    let outcome = dispatcher.dispatch(delivery_id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Scheduled { .. }));

    let delivery = storage.delivery(delivery_id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.last_status_code, Some(201));
    assert!(delivery.last_error.unwrap().contains("unexpected status 201"));
}

#[tokio::test]
async fn retries_stop_exactly_at_the_attempt_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream broken"))
        .expect(3)
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    // max_attempts is 3 in the fixture.
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), Arc::clone(&clock));
    assert!(matches!(
        dispatcher.dispatch(delivery_id).await.unwrap(),
        DispatchOutcome::Scheduled { .. }
    ));
    assert!(matches!(
        dispatcher.dispatch(delivery_id).await.unwrap(),
        DispatchOutcome::Scheduled { .. }
    ));
    assert_eq!(dispatcher.dispatch(delivery_id).await.unwrap(), DispatchOutcome::Failed);

    let delivery = storage.delivery(delivery_id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_count, 3);
    assert!(delivery.next_attempt_at.is_none());

    let target = storage.target(target.id).unwrap();
    assert_eq!(target.consecutive_failures, 3);

    // A terminal delivery never dispatches again.
    assert_eq!(dispatcher.dispatch(delivery_id).await.unwrap(), DispatchOutcome::Skipped);
    server.verify().await;
}

#[tokio::test]
async fn backoff_doubles_between_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    // Jitter-free policy in the fixture makes the schedule exact.
    let dispatcher = support::dispatcher(Arc::clone(&storage), Arc::clone(&clock));
    let DispatchOutcome::Scheduled { next_attempt_at: first } =
        dispatcher.dispatch(delivery_id).await.unwrap()
    else {
        panic!("expected a scheduled retry");
    };
    assert_eq!(first, clock.now_utc() + chrono::Duration::seconds(5));

    let DispatchOutcome::Scheduled { next_attempt_at: second } =
        dispatcher.dispatch(delivery_id).await.unwrap()
    else {
        panic!("expected a scheduled retry");
    };
    assert_eq!(second, clock.now_utc() + chrono::Duration::seconds(10));
}

#[tokio::test]
async fn response_bodies_are_truncated_to_a_snippet() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("y".repeat(5_000)))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), clock);
    dispatcher.dispatch(delivery_id).await.unwrap();

    let snippet = storage.delivery(delivery_id).unwrap().last_response_snippet.unwrap();
    assert_eq!(snippet.chars().count(), 1_003);
    let expected: String = "y".repeat(1_000) + "...";
    assert_eq!(snippet, expected);
}

#[tokio::test]
async fn error_text_is_truncated_too() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("e".repeat(5_000)))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), clock);
    dispatcher.dispatch(delivery_id).await.unwrap();

    let error = storage.delivery(delivery_id).unwrap().last_error.unwrap();
    assert_eq!(error.chars().count(), 1_003);
    assert!(error.starts_with("unexpected status 500: e"));
    assert!(error.ends_with("..."));
}

#[tokio::test]
async fn disabled_target_fails_without_spending_an_attempt() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, "http://localhost:1/hooks");
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    storage.set_target_enabled(target.id, false);

    let dispatcher = support::dispatcher(Arc::clone(&storage), clock);
    assert_eq!(dispatcher.dispatch(delivery_id).await.unwrap(), DispatchOutcome::Failed);

    let delivery = storage.delivery(delivery_id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_count, 0);
    assert_eq!(delivery.last_error.as_deref(), Some("target disabled"));

    let target = storage.target(target.id).unwrap();
    assert_eq!(target.consecutive_failures, 1);
    assert_eq!(target.last_error.as_deref(), Some("target disabled"));
}

#[tokio::test]
async fn one_success_resets_the_failure_streak() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let mut target = support::target(account, &server.uri());
    target.max_attempts = 10;
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), clock);
    for _ in 0..3 {
        dispatcher.dispatch(delivery_id).await.unwrap();
    }
    assert_eq!(storage.target(target.id).unwrap().consecutive_failures, 3);

    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert_eq!(dispatcher.dispatch(delivery_id).await.unwrap(), DispatchOutcome::Succeeded);
    assert_eq!(storage.target(target.id).unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn timeouts_are_retryable_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let mut target = support::target(account, &server.uri());
    target.timeout_ms = 1_000;
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), clock);
    let outcome = dispatcher.dispatch(delivery_id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Scheduled { .. }));

    let delivery = storage.delivery(delivery_id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert!(delivery.last_status_code.is_none());
    assert!(delivery.last_error.unwrap().contains("timeout"));
}

#[tokio::test]
async fn connection_failures_are_retryable() {
    // Nothing listens on this port.
    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, "http://127.0.0.1:9/hooks");
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), clock);
    let outcome = dispatcher.dispatch(delivery_id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Scheduled { .. }));
    assert!(storage
        .delivery(delivery_id)
        .unwrap()
        .last_error
        .unwrap()
        .contains("network error"));
}

#[tokio::test]
async fn requests_carry_headers_and_a_verifiable_signature() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), Arc::clone(&clock));
    dispatcher.dispatch(delivery_id).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let header_value = |name: &str| -> String {
        request
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    assert_eq!(header_value("x-event-id"), event.id.to_string());
    assert_eq!(header_value("x-event-type"), "message.inbound.received");
    assert_eq!(header_value("x-delivery-id"), delivery_id.to_string());
    assert_eq!(header_value("x-attempt"), "1");

    let body = String::from_utf8(request.body.clone()).unwrap();
    let timestamp: i64 = header_value("x-timestamp").parse().unwrap();
    assert_eq!(timestamp, clock.now_utc().timestamp());
    assert!(signing::verify_signature(
        &target.signing_secret,
        &body,
        timestamp,
        &header_value("x-signature"),
    ));

    // The envelope reproduces the event verbatim.
    let envelope: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(envelope["id"], event.id.to_string());
    assert_eq!(envelope["type"], "message.inbound.received");
    assert_eq!(envelope["accountId"], account.to_string());
    assert_eq!(envelope["payload"], event.payload);
}

#[tokio::test]
async fn retries_resend_an_identical_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, &server.uri());
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let dispatcher = support::dispatcher(Arc::clone(&storage), Arc::clone(&clock));
    dispatcher.dispatch(delivery_id).await.unwrap();
    dispatcher.dispatch(delivery_id).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);
    let attempt = |r: &wiremock::Request| {
        r.headers
            .get("x-attempt")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    assert_eq!(attempt(&requests[0]), "1");
    assert_eq!(attempt(&requests[1]), "2");
}

#[tokio::test]
async fn delivery_record_reflects_attempts_before_the_outcome() {
    // The attempt counter moves even when the outcome write never happens,
    // which is what keeps the budget bound under crashes.
    let storage = Arc::new(InMemoryStorage::new());
    let clock = support::clock();
    let account = AccountId::new();
    let target = support::target(account, "http://127.0.0.1:9/hooks");
    storage.insert_target(target.clone());
    let event = support::event(account, None);
    let delivery_id = support::plan_one(&storage, &event, &target).await;

    let before = storage.delivery(delivery_id).unwrap();
    assert_eq!(before.attempt_count, 0);
    assert!(before.last_attempt_at.is_none());

    let dispatcher = support::dispatcher(Arc::clone(&storage), Arc::clone(&clock));
    dispatcher.dispatch(delivery_id).await.unwrap();

    let after = storage.delivery(delivery_id).unwrap();
    assert_eq!(after.attempt_count, 1);
    assert_eq!(after.last_attempt_at, Some(clock.now_utc()));
}
