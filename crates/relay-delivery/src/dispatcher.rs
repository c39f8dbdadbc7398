//! Single-delivery dispatch: one attempt, then success, retry, or terminal
//! failure.

use std::sync::Arc;
use std::time::Duration;

use relay_core::{Clock, Delivery, DeliveryId, Event, Target};
use tracing::{debug, error, info, warn};

use crate::client::{DeliveryClient, DeliveryRequest, DeliveryResponse};
use crate::envelope::Envelope;
use crate::error::{DeliveryError, Result};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::signing;
use crate::storage::EngineStorage;

/// Characters of response body or error text persisted on a delivery.
const MAX_STORED_CHARS: usize = 1000;

/// What happened to a delivery during one dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The delivery was already terminal or missing; nothing was done.
    Skipped,
    /// The target returned HTTP 200. Terminal.
    Succeeded,
    /// The attempt failed with budget remaining; another attempt is due at
    /// the given instant.
    Scheduled {
        /// When the delivery becomes due again.
        next_attempt_at: chrono::DateTime<chrono::Utc>,
    },
    /// The delivery failed terminally.
    Failed,
}

/// Executes delivery attempts against webhook targets.
///
/// The attempt counter is spent before the request is sent, so a crash
/// mid-flight costs the attempt rather than repeating it without bound.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    storage: Arc<dyn EngineStorage>,
    client: DeliveryClient,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        client: DeliveryClient,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, client, retry_policy, clock }
    }

    /// Runs one delivery attempt end to end.
    ///
    /// Safe to call with any delivery ID: terminal and unknown deliveries
    /// are skipped, so redundant claims collapse into no-ops.
    pub async fn dispatch(&self, delivery_id: DeliveryId) -> Result<DispatchOutcome> {
        let Some(delivery) = self.storage.find_delivery(delivery_id).await? else {
            debug!(delivery_id = %delivery_id, "delivery not found, skipping");
            return Ok(DispatchOutcome::Skipped);
        };
        if delivery.status.is_terminal() {
            debug!(delivery_id = %delivery_id, status = %delivery.status, "delivery already terminal");
            return Ok(DispatchOutcome::Skipped);
        }

        let Some(target) = self.storage.find_target(delivery.target_id).await? else {
            debug!(delivery_id = %delivery_id, target_id = %delivery.target_id, "target missing, skipping");
            return Ok(DispatchOutcome::Skipped);
        };
        if !target.enabled {
            return self.fail_disabled(&delivery).await;
        }

        let Some(event) = self.storage.find_event(delivery.event_id).await? else {
            debug!(delivery_id = %delivery_id, event_id = %delivery.event_id, "event missing, skipping");
            return Ok(DispatchOutcome::Skipped);
        };

        // Spend the attempt before any network traffic so a crash between
        // here and the outcome write can never exceed the budget.
        let now = self.clock.now_utc();
        let attempt_number = self.storage.begin_attempt(delivery.id, now).await?;

        let request = self.build_request(&delivery, &target, &event, attempt_number)?;
        match self.client.deliver(&request).await {
            Ok(response) if response.status_code == 200 => {
                self.complete_success(&delivery, &target, &response, attempt_number)
                    .await
            }
            Ok(response) => {
                let err = DeliveryError::unexpected_status(response.status_code, response.body);
                self.complete_failure(&delivery, &target, attempt_number, &err)
                    .await
            }
            Err(err) => {
                self.complete_failure(&delivery, &target, attempt_number, &err)
                    .await
            }
        }
    }

    fn build_request(
        &self,
        delivery: &Delivery,
        target: &Target,
        event: &Event,
        attempt_number: i32,
    ) -> Result<DeliveryRequest> {
        let body = serde_json::to_string(&Envelope::for_event(event))
            .map_err(|e| DeliveryError::internal(format!("envelope serialization: {e}")))?;
        let timestamp = self.clock.now_utc().timestamp();
        let signature = signing::sign_payload(&target.signing_secret, &body, timestamp);

        Ok(DeliveryRequest {
            delivery_id: delivery.id,
            event_id: event.id,
            event_type: event.event_type,
            attempt_number,
            url: target.url.clone(),
            body,
            timestamp,
            signature,
            timeout: Duration::from_millis(target.timeout_ms.max(0) as u64),
        })
    }

    async fn complete_success(
        &self,
        delivery: &Delivery,
        target: &Target,
        response: &DeliveryResponse,
        attempt_number: i32,
    ) -> Result<DispatchOutcome> {
        let now = self.clock.now_utc();
        let snippet = truncate_for_storage(&response.body);
        self.storage
            .mark_delivery_succeeded(delivery.id, i32::from(response.status_code), &snippet, now)
            .await?;
        self.storage
            .record_target_success(delivery.target_id, now)
            .await?;

        info!(
            delivery_id = %delivery.id,
            event_id = %delivery.event_id,
            target_id = %delivery.target_id,
            target_url = %target.url,
            attempt = attempt_number,
            duration_ms = response.duration.as_millis() as u64,
            "delivery succeeded"
        );
        Ok(DispatchOutcome::Succeeded)
    }

    async fn complete_failure(
        &self,
        delivery: &Delivery,
        target: &Target,
        attempt_number: i32,
        err: &DeliveryError,
    ) -> Result<DispatchOutcome> {
        let now = self.clock.now_utc();
        let status_code = err.status_code().map(i32::from);
        let error_text = match err {
            DeliveryError::UnexpectedStatus { status_code, body } if !body.is_empty() => {
                truncate_for_storage(&format!("unexpected status {status_code}: {body}"))
            }
            other => truncate_for_storage(&other.to_string()),
        };

        self.storage
            .record_target_failure(delivery.target_id, now, &error_text)
            .await?;

        match self
            .retry_policy
            .decide(attempt_number, delivery.max_attempts, now)
        {
            RetryDecision::Retry { next_attempt_at } => {
                self.storage
                    .schedule_delivery_retry(delivery.id, next_attempt_at, status_code, &error_text)
                    .await?;
                warn!(
                    delivery_id = %delivery.id,
                    target_id = %delivery.target_id,
                    target_url = %target.url,
                    attempt = attempt_number,
                    max_attempts = delivery.max_attempts,
                    status_code = ?status_code,
                    error = %error_text,
                    next_attempt_at = %next_attempt_at,
                    "delivery attempt failed, retry scheduled"
                );
                Ok(DispatchOutcome::Scheduled { next_attempt_at })
            }
            RetryDecision::GiveUp => {
                self.storage
                    .mark_delivery_failed(delivery.id, status_code, &error_text)
                    .await?;
                error!(
                    delivery_id = %delivery.id,
                    target_id = %delivery.target_id,
                    target_url = %target.url,
                    attempts = attempt_number,
                    status_code = ?status_code,
                    error = %error_text,
                    "delivery failed permanently"
                );
                Ok(DispatchOutcome::Failed)
            }
        }
    }

    // Terminal failure without spending an attempt: the delivery never got
    // as far as the network.
    async fn fail_disabled(&self, delivery: &Delivery) -> Result<DispatchOutcome> {
        let now = self.clock.now_utc();
        self.storage
            .mark_delivery_failed(delivery.id, None, "target disabled")
            .await?;
        self.storage
            .record_target_failure(delivery.target_id, now, "target disabled")
            .await?;
        warn!(
            delivery_id = %delivery.id,
            target_id = %delivery.target_id,
            "target disabled, delivery failed without an attempt"
        );
        Ok(DispatchOutcome::Failed)
    }
}

/// Bounds stored response bodies and error text at 1000 characters,
/// appending `...` when anything was cut.
pub(crate) fn truncate_for_storage(text: &str) -> String {
    let mut chars = text.char_indices();
    match chars.nth(MAX_STORED_CHARS) {
        Some((byte_index, _)) => {
            let mut truncated = text[..byte_index].to_string();
            truncated.push_str("...");
            truncated
        }
        None => text.to_string(),
    }
}
