//! Repository for webhook target configuration and health bookkeeping.
//!
//! Targets are created, updated, and deleted by the external
//! target-management service. This repository reads configuration and
//! writes only the bookkeeping columns, always as single-row atomic
//! UPDATEs so concurrent deliveries to the same target never lose counter
//! increments.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AccountId, EventType, Target, TargetId},
};

const TARGET_COLUMNS: &str = "id, account_id, url, enabled, subscribed_events, signing_secret, \
                              max_attempts, timeout_ms, consecutive_failures, last_delivery_at, \
                              last_success_at, last_failure_at, last_error, created_at, updated_at";

/// Database operations for targets.
#[derive(Debug)]
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Fetches a target by ID.
    pub async fn find_by_id(&self, target_id: TargetId) -> Result<Option<Target>> {
        let target = sqlx::query_as::<_, Target>(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE id = $1"
        ))
        .bind(target_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(target)
    }

    /// Lists enabled targets of an account subscribed to an event type.
    pub async fn list_subscribed(
        &self,
        account_id: AccountId,
        event_type: EventType,
    ) -> Result<Vec<Target>> {
        let targets = sqlx::query_as::<_, Target>(&format!(
            r"
            SELECT {TARGET_COLUMNS} FROM targets
            WHERE account_id = $1
              AND enabled
              AND $2 = ANY(subscribed_events)
            ORDER BY created_at ASC
            "
        ))
        .bind(account_id)
        .bind(event_type.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(targets)
    }

    /// Records a successful delivery: resets the failure streak and clears
    /// the stored error.
    pub async fn record_success(&self, target_id: TargetId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            UPDATE targets
            SET last_delivery_at = $2,
                last_success_at = $2,
                consecutive_failures = 0,
                last_error = NULL,
                updated_at = $2
            WHERE id = $1
            ",
        )
        .bind(target_id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records a failed attempt: increments the failure streak in-place.
    pub async fn record_failure(
        &self,
        target_id: TargetId,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE targets
            SET last_delivery_at = $2,
                last_failure_at = $2,
                consecutive_failures = consecutive_failures + 1,
                last_error = $3,
                updated_at = $2
            WHERE id = $1
            ",
        )
        .bind(target_id)
        .bind(now)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
