//! Storage abstraction for the delivery engine.
//!
//! The engine talks to persistence through the dyn-safe [`EngineStorage`]
//! trait so its logic can run against Postgres in production and an
//! in-memory store in tests. Methods return boxed futures to keep the
//! trait object-safe.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::{
    AccountId, Delivery, DeliveryId, DeliveryRecord, Event, EventId, EventType, Target, TargetId,
};

/// Boxed future returned by storage methods.
pub type StorageFuture<'a, T> =
    Pin<Box<dyn Future<Output = relay_core::Result<T>> + Send + 'a>>;

/// Persistence operations the delivery engine needs.
///
/// Contract notes:
/// - `create_event` fails with a constraint violation when a dedupe key
///   collides; the ingress resolves the race by re-reading the winner.
/// - `create_delivery` returns false when a delivery already exists for
///   the same (event, target) pair, making planning idempotent.
/// - `claim_due_deliveries` hands each due delivery to exactly one caller
///   and pushes `next_attempt_at` to `lease_until` so a crashed worker's
///   claim expires on its own.
pub trait EngineStorage: Send + Sync + std::fmt::Debug {
    /// Persists a new event.
    fn create_event<'a>(&'a self, event: &'a Event) -> StorageFuture<'a, EventId>;

    /// Loads an event by ID.
    fn find_event(&self, event_id: EventId) -> StorageFuture<'_, Option<Event>>;

    /// Finds the event previously stored under a dedupe key, if any.
    fn find_event_by_dedupe_key<'a>(
        &'a self,
        account_id: AccountId,
        dedupe_key: &'a str,
    ) -> StorageFuture<'a, Option<Event>>;

    /// Loads a target by ID.
    fn find_target(&self, target_id: TargetId) -> StorageFuture<'_, Option<Target>>;

    /// Enabled targets of an account subscribed to an event type.
    fn list_subscribed_targets(
        &self,
        account_id: AccountId,
        event_type: EventType,
    ) -> StorageFuture<'_, Vec<Target>>;

    /// Persists a planned delivery. Returns false if the (event, target)
    /// pair already has one.
    fn create_delivery<'a>(&'a self, delivery: &'a Delivery) -> StorageFuture<'a, bool>;

    /// Loads a delivery by ID.
    fn find_delivery(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Option<Delivery>>;

    /// Claims up to `batch_size` due deliveries, leasing them until
    /// `lease_until`.
    fn claim_due_deliveries(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<DeliveryId>>;

    /// Spends one attempt before any network traffic. Returns the new
    /// attempt count.
    fn begin_attempt(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, i32>;

    /// Marks a delivery terminally succeeded.
    fn mark_delivery_succeeded<'a>(
        &'a self,
        delivery_id: DeliveryId,
        status_code: i32,
        response_snippet: &'a str,
        now: DateTime<Utc>,
    ) -> StorageFuture<'a, ()>;

    /// Schedules the next attempt of a still-pending delivery.
    fn schedule_delivery_retry<'a>(
        &'a self,
        delivery_id: DeliveryId,
        next_attempt_at: DateTime<Utc>,
        status_code: Option<i32>,
        error: &'a str,
    ) -> StorageFuture<'a, ()>;

    /// Marks a delivery terminally failed.
    fn mark_delivery_failed<'a>(
        &'a self,
        delivery_id: DeliveryId,
        status_code: Option<i32>,
        error: &'a str,
    ) -> StorageFuture<'a, ()>;

    /// Resets a target's failure streak after a successful delivery.
    fn record_target_success(
        &self,
        target_id: TargetId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Increments a target's failure streak after a failed attempt.
    fn record_target_failure<'a>(
        &'a self,
        target_id: TargetId,
        now: DateTime<Utc>,
        error: &'a str,
    ) -> StorageFuture<'a, ()>;

    /// Most recent deliveries for a target, newest first.
    fn list_recent_deliveries(
        &self,
        target_id: TargetId,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>>;
}

/// Production [`EngineStorage`] backed by the Postgres repositories.
#[derive(Debug, Clone)]
pub struct PostgresEngineStorage {
    storage: Arc<relay_core::Storage>,
}

impl PostgresEngineStorage {
    /// Wraps the shared repository container.
    pub fn new(storage: Arc<relay_core::Storage>) -> Self {
        Self { storage }
    }
}

impl EngineStorage for PostgresEngineStorage {
    fn create_event<'a>(&'a self, event: &'a Event) -> StorageFuture<'a, EventId> {
        Box::pin(async move { self.storage.events.create(event).await })
    }

    fn find_event(&self, event_id: EventId) -> StorageFuture<'_, Option<Event>> {
        Box::pin(async move { self.storage.events.find_by_id(event_id).await })
    }

    fn find_event_by_dedupe_key<'a>(
        &'a self,
        account_id: AccountId,
        dedupe_key: &'a str,
    ) -> StorageFuture<'a, Option<Event>> {
        Box::pin(async move {
            self.storage
                .events
                .find_by_dedupe_key(account_id, dedupe_key)
                .await
        })
    }

    fn find_target(&self, target_id: TargetId) -> StorageFuture<'_, Option<Target>> {
        Box::pin(async move { self.storage.targets.find_by_id(target_id).await })
    }

    fn list_subscribed_targets(
        &self,
        account_id: AccountId,
        event_type: EventType,
    ) -> StorageFuture<'_, Vec<Target>> {
        Box::pin(async move {
            self.storage
                .targets
                .list_subscribed(account_id, event_type)
                .await
        })
    }

    fn create_delivery<'a>(&'a self, delivery: &'a Delivery) -> StorageFuture<'a, bool> {
        Box::pin(async move { self.storage.deliveries.create(delivery).await })
    }

    fn find_delivery(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.storage.deliveries.find_by_id(delivery_id).await })
    }

    fn claim_due_deliveries(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<DeliveryId>> {
        Box::pin(async move {
            self.storage
                .deliveries
                .claim_due(batch_size, now, lease_until)
                .await
        })
    }

    fn begin_attempt(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, i32> {
        Box::pin(async move { self.storage.deliveries.begin_attempt(delivery_id, now).await })
    }

    fn mark_delivery_succeeded<'a>(
        &'a self,
        delivery_id: DeliveryId,
        status_code: i32,
        response_snippet: &'a str,
        now: DateTime<Utc>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.storage
                .deliveries
                .mark_succeeded(delivery_id, status_code, response_snippet, now)
                .await
        })
    }

    fn schedule_delivery_retry<'a>(
        &'a self,
        delivery_id: DeliveryId,
        next_attempt_at: DateTime<Utc>,
        status_code: Option<i32>,
        error: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.storage
                .deliveries
                .schedule_retry(delivery_id, next_attempt_at, status_code, error)
                .await
        })
    }

    fn mark_delivery_failed<'a>(
        &'a self,
        delivery_id: DeliveryId,
        status_code: Option<i32>,
        error: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.storage
                .deliveries
                .mark_failed(delivery_id, status_code, error)
                .await
        })
    }

    fn record_target_success(
        &self,
        target_id: TargetId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.targets.record_success(target_id, now).await })
    }

    fn record_target_failure<'a>(
        &'a self,
        target_id: TargetId,
        now: DateTime<Utc>,
        error: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.storage
                .targets
                .record_failure(target_id, now, error)
                .await
        })
    }

    fn list_recent_deliveries(
        &self,
        target_id: TargetId,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
        Box::pin(async move { self.storage.deliveries.list_recent(target_id, limit).await })
    }
}

pub mod mem {
    //! In-memory [`EngineStorage`] for tests.
    //!
    //! Mirrors the Postgres contract closely enough that engine tests
    //! exercise the same code paths: dedupe keys collide, planning is
    //! idempotent per (event, target) pair, and claims lease deliveries.

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use relay_core::{CoreError, DeliveryStatus};

    use super::*;

    #[derive(Debug, Default)]
    struct State {
        events: HashMap<EventId, Event>,
        dedupe_index: HashMap<(AccountId, String), EventId>,
        targets: HashMap<TargetId, Target>,
        deliveries: HashMap<DeliveryId, Delivery>,
        planned_pairs: HashSet<(EventId, TargetId)>,
    }

    /// Hash-map backed storage with the Postgres adapter's semantics.
    #[derive(Debug, Default)]
    pub struct InMemoryStorage {
        state: Mutex<State>,
    }

    impl InMemoryStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().expect("storage state lock poisoned")
        }

        /// Inserts a target directly, bypassing the engine.
        pub fn insert_target(&self, target: Target) {
            self.lock().targets.insert(target.id, target);
        }

        /// Flips a target's enabled flag, as the external management
        /// service would.
        pub fn set_target_enabled(&self, target_id: TargetId, enabled: bool) {
            if let Some(target) = self.lock().targets.get_mut(&target_id) {
                target.enabled = enabled;
            }
        }

        /// Snapshot of a target for assertions.
        pub fn target(&self, target_id: TargetId) -> Option<Target> {
            self.lock().targets.get(&target_id).cloned()
        }

        /// Snapshot of a delivery for assertions.
        pub fn delivery(&self, delivery_id: DeliveryId) -> Option<Delivery> {
            self.lock().deliveries.get(&delivery_id).cloned()
        }

        /// All deliveries planned for an event.
        pub fn deliveries_for_event(&self, event_id: EventId) -> Vec<Delivery> {
            self.lock()
                .deliveries
                .values()
                .filter(|d| d.event_id == event_id)
                .cloned()
                .collect()
        }
    }

    impl EngineStorage for InMemoryStorage {
        fn create_event<'a>(&'a self, event: &'a Event) -> StorageFuture<'a, EventId> {
            let result = (|| {
                let mut state = self.lock();
                if let Some(key) = &event.dedupe_key {
                    let index_key = (event.account_id, key.clone());
                    if state.dedupe_index.contains_key(&index_key) {
                        return Err(CoreError::ConstraintViolation(format!(
                            "duplicate dedupe key: {key}"
                        )));
                    }
                    state.dedupe_index.insert(index_key, event.id);
                }
                state.events.insert(event.id, event.clone());
                Ok(event.id)
            })();
            Box::pin(async move { result })
        }

        fn find_event(&self, event_id: EventId) -> StorageFuture<'_, Option<Event>> {
            let result = Ok(self.lock().events.get(&event_id).cloned());
            Box::pin(async move { result })
        }

        fn find_event_by_dedupe_key<'a>(
            &'a self,
            account_id: AccountId,
            dedupe_key: &'a str,
        ) -> StorageFuture<'a, Option<Event>> {
            let result = (|| {
                let state = self.lock();
                let event_id = state
                    .dedupe_index
                    .get(&(account_id, dedupe_key.to_string()))?;
                state.events.get(event_id).cloned()
            })();
            Box::pin(async move { Ok(result) })
        }

        fn find_target(&self, target_id: TargetId) -> StorageFuture<'_, Option<Target>> {
            let result = Ok(self.lock().targets.get(&target_id).cloned());
            Box::pin(async move { result })
        }

        fn list_subscribed_targets(
            &self,
            account_id: AccountId,
            event_type: EventType,
        ) -> StorageFuture<'_, Vec<Target>> {
            let mut targets: Vec<Target> = self
                .lock()
                .targets
                .values()
                .filter(|t| t.account_id == account_id && t.subscribes_to(event_type))
                .cloned()
                .collect();
            targets.sort_by_key(|t| t.created_at);
            Box::pin(async move { Ok(targets) })
        }

        fn create_delivery<'a>(&'a self, delivery: &'a Delivery) -> StorageFuture<'a, bool> {
            let inserted = {
                let mut state = self.lock();
                let pair = (delivery.event_id, delivery.target_id);
                if state.planned_pairs.contains(&pair) {
                    false
                } else {
                    state.planned_pairs.insert(pair);
                    state.deliveries.insert(delivery.id, delivery.clone());
                    true
                }
            };
            Box::pin(async move { Ok(inserted) })
        }

        fn find_delivery(&self, delivery_id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
            let result = Ok(self.lock().deliveries.get(&delivery_id).cloned());
            Box::pin(async move { result })
        }

        fn claim_due_deliveries(
            &self,
            batch_size: usize,
            now: DateTime<Utc>,
            lease_until: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<DeliveryId>> {
            let claimed = {
                let mut state = self.lock();
                let mut due: Vec<(DateTime<Utc>, DeliveryId)> = state
                    .deliveries
                    .values()
                    .filter(|d| d.status == DeliveryStatus::Pending)
                    .filter_map(|d| {
                        d.next_attempt_at
                            .filter(|at| *at <= now)
                            .map(|at| (at, d.id))
                    })
                    .collect();
                due.sort_by_key(|(at, _)| *at);
                due.truncate(batch_size);
                let ids: Vec<DeliveryId> = due.into_iter().map(|(_, id)| id).collect();
                for id in &ids {
                    if let Some(delivery) = state.deliveries.get_mut(id) {
                        delivery.next_attempt_at = Some(lease_until);
                    }
                }
                ids
            };
            Box::pin(async move { Ok(claimed) })
        }

        fn begin_attempt(
            &self,
            delivery_id: DeliveryId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, i32> {
            let result = {
                let mut state = self.lock();
                match state.deliveries.get_mut(&delivery_id) {
                    Some(delivery) => {
                        delivery.attempt_count += 1;
                        delivery.last_attempt_at = Some(now);
                        Ok(delivery.attempt_count)
                    }
                    None => Err(CoreError::NotFound(format!("delivery {delivery_id}"))),
                }
            };
            Box::pin(async move { result })
        }

        fn mark_delivery_succeeded<'a>(
            &'a self,
            delivery_id: DeliveryId,
            status_code: i32,
            response_snippet: &'a str,
            now: DateTime<Utc>,
        ) -> StorageFuture<'a, ()> {
            let result = {
                let mut state = self.lock();
                match state.deliveries.get_mut(&delivery_id) {
                    Some(delivery) => {
                        delivery.status = DeliveryStatus::Succeeded;
                        delivery.last_status_code = Some(status_code);
                        delivery.last_response_snippet = Some(response_snippet.to_string());
                        delivery.last_error = None;
                        delivery.delivered_at = Some(now);
                        delivery.next_attempt_at = None;
                        Ok(())
                    }
                    None => Err(CoreError::NotFound(format!("delivery {delivery_id}"))),
                }
            };
            Box::pin(async move { result })
        }

        fn schedule_delivery_retry<'a>(
            &'a self,
            delivery_id: DeliveryId,
            next_attempt_at: DateTime<Utc>,
            status_code: Option<i32>,
            error: &'a str,
        ) -> StorageFuture<'a, ()> {
            let result = {
                let mut state = self.lock();
                match state.deliveries.get_mut(&delivery_id) {
                    Some(delivery) => {
                        delivery.next_attempt_at = Some(next_attempt_at);
                        delivery.last_status_code = status_code;
                        delivery.last_error = Some(error.to_string());
                        Ok(())
                    }
                    None => Err(CoreError::NotFound(format!("delivery {delivery_id}"))),
                }
            };
            Box::pin(async move { result })
        }

        fn mark_delivery_failed<'a>(
            &'a self,
            delivery_id: DeliveryId,
            status_code: Option<i32>,
            error: &'a str,
        ) -> StorageFuture<'a, ()> {
            let result = {
                let mut state = self.lock();
                match state.deliveries.get_mut(&delivery_id) {
                    Some(delivery) => {
                        delivery.status = DeliveryStatus::Failed;
                        delivery.last_status_code = status_code;
                        delivery.last_error = Some(error.to_string());
                        delivery.next_attempt_at = None;
                        Ok(())
                    }
                    None => Err(CoreError::NotFound(format!("delivery {delivery_id}"))),
                }
            };
            Box::pin(async move { result })
        }

        fn record_target_success(
            &self,
            target_id: TargetId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            let result = {
                let mut state = self.lock();
                match state.targets.get_mut(&target_id) {
                    Some(target) => {
                        target.last_delivery_at = Some(now);
                        target.last_success_at = Some(now);
                        target.consecutive_failures = 0;
                        target.last_error = None;
                        target.updated_at = now;
                        Ok(())
                    }
                    None => Err(CoreError::NotFound(format!("target {target_id}"))),
                }
            };
            Box::pin(async move { result })
        }

        fn record_target_failure<'a>(
            &'a self,
            target_id: TargetId,
            now: DateTime<Utc>,
            error: &'a str,
        ) -> StorageFuture<'a, ()> {
            let result = {
                let mut state = self.lock();
                match state.targets.get_mut(&target_id) {
                    Some(target) => {
                        target.last_delivery_at = Some(now);
                        target.last_failure_at = Some(now);
                        target.consecutive_failures += 1;
                        target.last_error = Some(error.to_string());
                        target.updated_at = now;
                        Ok(())
                    }
                    None => Err(CoreError::NotFound(format!("target {target_id}"))),
                }
            };
            Box::pin(async move { result })
        }

        fn list_recent_deliveries(
            &self,
            target_id: TargetId,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
            let records = {
                let state = self.lock();
                let mut deliveries: Vec<&Delivery> = state
                    .deliveries
                    .values()
                    .filter(|d| d.target_id == target_id)
                    .collect();
                deliveries
                    .sort_by_key(|d| std::cmp::Reverse(d.last_attempt_at.unwrap_or(d.created_at)));
                deliveries
                    .into_iter()
                    .take(limit)
                    .filter_map(|d| {
                        let event = state.events.get(&d.event_id)?;
                        Some(DeliveryRecord {
                            id: d.id,
                            event_id: d.event_id,
                            status: d.status,
                            attempt_count: d.attempt_count,
                            max_attempts: d.max_attempts,
                            next_attempt_at: d.next_attempt_at,
                            last_attempt_at: d.last_attempt_at,
                            last_status_code: d.last_status_code,
                            last_error: d.last_error.clone(),
                            last_response_snippet: d.last_response_snippet.clone(),
                            delivered_at: d.delivered_at,
                            created_at: d.created_at,
                            event_type: event.event_type,
                            event_occurred_at: event.occurred_at,
                        })
                    })
                    .collect()
            };
            Box::pin(async move { Ok(records) })
        }
    }
}
