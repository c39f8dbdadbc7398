//! Event ingestion with account-scoped deduplication.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::{AccountId, Clock, Event, EventId, EventSource, EventType};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};
use crate::planner::DeliveryPlanner;
use crate::storage::EngineStorage;

/// An event submission before it is persisted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    /// Account the event belongs to.
    pub account_id: AccountId,
    /// Event type in dotted form.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Where the event originated.
    pub source: EventSource,
    /// When the event occurred. Defaults to submission time.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    /// Domain payload, forwarded verbatim to targets.
    pub payload: serde_json::Value,
    /// Optional idempotency token, unique per account.
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

/// Outcome of an event submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitReceipt {
    /// The stored event, whether newly created or found via dedupe.
    pub event_id: EventId,
    /// True if an earlier submission already created this event.
    pub deduped: bool,
    /// True if delivery planning was kicked off for this submission.
    pub queued: bool,
}

/// Accepts events and hands them to the planner.
#[derive(Debug, Clone)]
pub struct EventIngress {
    storage: Arc<dyn EngineStorage>,
    planner: Arc<DeliveryPlanner>,
    clock: Arc<dyn Clock>,
}

impl EventIngress {
    /// Creates an ingress over shared storage.
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        planner: Arc<DeliveryPlanner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, planner, clock }
    }

    /// Persists an event and schedules fan-out planning.
    ///
    /// With a dedupe key, resubmission returns the original event without
    /// creating new delivery work. Two concurrent submissions of the same
    /// key race on the unique index; the loser re-reads the winner's
    /// event, so both callers see the same receipt.
    pub async fn submit_event(&self, new_event: NewEvent) -> Result<SubmitReceipt> {
        if let Some(key) = &new_event.dedupe_key {
            if let Some(existing) = self
                .storage
                .find_event_by_dedupe_key(new_event.account_id, key)
                .await?
            {
                debug!(event_id = %existing.id, dedupe_key = %key, "event deduplicated");
                return Ok(SubmitReceipt {
                    event_id: existing.id,
                    deduped: true,
                    queued: false,
                });
            }
        }

        let now = self.clock.now_utc();
        let event = Event::new(
            new_event.account_id,
            new_event.event_type,
            new_event.source,
            new_event.occurred_at.unwrap_or(now),
            new_event.payload,
            new_event.dedupe_key.clone(),
            now,
        );

        let event_id = match self.storage.create_event(&event).await {
            Ok(id) => id,
            Err(err) if err.is_constraint_violation() && new_event.dedupe_key.is_some() => {
                // Lost the insert race; the winner's event is authoritative.
                let key = new_event.dedupe_key.as_deref().unwrap_or_default();
                let existing = self
                    .storage
                    .find_event_by_dedupe_key(new_event.account_id, key)
                    .await?
                    .ok_or_else(|| {
                        DeliveryError::internal(format!(
                            "dedupe key {key} collided but no event found"
                        ))
                    })?;
                return Ok(SubmitReceipt {
                    event_id: existing.id,
                    deduped: true,
                    queued: false,
                });
            }
            Err(err) => return Err(err.into()),
        };

        self.spawn_planning(event_id);

        Ok(SubmitReceipt { event_id, deduped: false, queued: true })
    }

    fn spawn_planning(&self, event_id: EventId) {
        let planner = Arc::clone(&self.planner);
        tokio::spawn(async move {
            if let Err(error) = planner.plan_deliveries(event_id).await {
                // Planning is idempotent; a later replan can pick this up.
                warn!(event_id = %event_id, %error, "delivery planning failed");
            }
        });
    }
}
