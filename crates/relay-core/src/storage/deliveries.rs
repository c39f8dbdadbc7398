//! Repository for delivery state tracking.
//!
//! Deliveries carry the retry loop's persistent state. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never contend for the
//! same rows, and pushes `next_attempt_at` forward by a lease so a worker
//! crash mid-attempt makes the delivery due again instead of lost.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{Delivery, DeliveryId, DeliveryRecord, TargetId},
};

const DELIVERY_COLUMNS: &str = "id, account_id, event_id, target_id, status, attempt_count, \
                                max_attempts, next_attempt_at, last_attempt_at, last_status_code, \
                                last_error, last_response_snippet, delivered_at, created_at";

/// Database operations for deliveries.
#[derive(Debug)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Persists a planned delivery.
    ///
    /// Returns `false` when a delivery for the same `(event_id, target_id)`
    /// pair already exists, which makes duplicate planner invocations
    /// no-ops.
    pub async fn create(&self, delivery: &Delivery) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO deliveries (
                id, account_id, event_id, target_id, status, attempt_count,
                max_attempts, next_attempt_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id, target_id) DO NOTHING
            ",
        )
        .bind(delivery.id)
        .bind(delivery.account_id)
        .bind(delivery.event_id)
        .bind(delivery.target_id)
        .bind(delivery.status)
        .bind(delivery.attempt_count)
        .bind(delivery.max_attempts)
        .bind(delivery.next_attempt_at)
        .bind(delivery.created_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetches a delivery by ID.
    pub async fn find_by_id(&self, delivery_id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = $1"
        ))
        .bind(delivery_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Claims pending deliveries that are due for an attempt.
    ///
    /// Claimed rows get `next_attempt_at` pushed to `lease_until`; the
    /// dispatcher overwrites it with the real outcome, and a crashed
    /// worker's claims simply become due again when the lease expires.
    pub async fn claim_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<DeliveryId>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM deliveries
            WHERE status = 'pending'
              AND next_attempt_at IS NOT NULL
              AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        sqlx::query("UPDATE deliveries SET next_attempt_at = $2 WHERE id = ANY($1)")
            .bind(&ids)
            .bind(lease_until)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(ids.into_iter().map(DeliveryId).collect())
    }

    /// Spends one attempt: increments the counter and stamps the attempt
    /// time, before any network traffic happens.
    pub async fn begin_attempt(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let attempt_count: i32 = sqlx::query_scalar(
            r"
            UPDATE deliveries
            SET attempt_count = attempt_count + 1, last_attempt_at = $2
            WHERE id = $1
            RETURNING attempt_count
            ",
        )
        .bind(delivery_id)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(attempt_count)
    }

    /// Marks a delivery as succeeded. Terminal.
    pub async fn mark_succeeded(
        &self,
        delivery_id: DeliveryId,
        status_code: i32,
        response_snippet: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE deliveries
            SET status = 'succeeded',
                last_status_code = $2,
                last_response_snippet = $3,
                last_error = NULL,
                delivered_at = $4,
                next_attempt_at = NULL
            WHERE id = $1
            ",
        )
        .bind(delivery_id)
        .bind(status_code)
        .bind(response_snippet)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Schedules the next attempt of a still-pending delivery.
    pub async fn schedule_retry(
        &self,
        delivery_id: DeliveryId,
        next_attempt_at: DateTime<Utc>,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE deliveries
            SET next_attempt_at = $2, last_status_code = $3, last_error = $4
            WHERE id = $1
            ",
        )
        .bind(delivery_id)
        .bind(next_attempt_at)
        .bind(status_code)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a delivery as permanently failed. Terminal.
    pub async fn mark_failed(
        &self,
        delivery_id: DeliveryId,
        status_code: Option<i32>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE deliveries
            SET status = 'failed',
                last_status_code = $2,
                last_error = $3,
                next_attempt_at = NULL
            WHERE id = $1
            ",
        )
        .bind(delivery_id)
        .bind(status_code)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Most recent deliveries for a target, enriched with the originating
    /// event's type and occurrence time.
    pub async fn list_recent(
        &self,
        target_id: TargetId,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            r"
            SELECT d.id, d.event_id, d.status, d.attempt_count, d.max_attempts,
                   d.next_attempt_at, d.last_attempt_at, d.last_status_code,
                   d.last_error, d.last_response_snippet, d.delivered_at,
                   d.created_at, e.event_type, e.occurred_at AS event_occurred_at
            FROM deliveries d
            JOIN events e ON e.id = d.event_id
            WHERE d.target_id = $1
            ORDER BY COALESCE(d.last_attempt_at, d.created_at) DESC
            LIMIT $2
            ",
        )
        .bind(target_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }
}
