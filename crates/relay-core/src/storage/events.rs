//! Repository for immutable domain events.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AccountId, Event, EventId},
};

const EVENT_COLUMNS: &str =
    "id, account_id, event_type, source, occurred_at, payload, dedupe_key, created_at";

/// Database operations for events.
///
/// Events are insert-only. The unique index on `(account_id, dedupe_key)`
/// enforces per-account idempotency; a duplicate insert surfaces as
/// `CoreError::ConstraintViolation`, which the ingress resolves by
/// re-reading the winning row.
#[derive(Debug)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Persists a new event.
    pub async fn create(&self, event: &Event) -> Result<EventId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO events (
                id, account_id, event_type, source, occurred_at, payload,
                dedupe_key, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(event.id)
        .bind(event.account_id)
        .bind(event.event_type)
        .bind(event.source)
        .bind(event.occurred_at)
        .bind(&event.payload)
        .bind(&event.dedupe_key)
        .bind(event.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(EventId(id))
    }

    /// Fetches an event by ID.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Fetches the event owning a dedupe key within an account, if any.
    pub async fn find_by_dedupe_key(
        &self,
        account_id: AccountId,
        dedupe_key: &str,
    ) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE account_id = $1 AND dedupe_key = $2"
        ))
        .bind(account_id)
        .bind(dedupe_key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }
}
