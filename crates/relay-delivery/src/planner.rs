//! Fan-out planning: one delivery per subscribed target.

use std::sync::Arc;

use relay_core::{Clock, Delivery, EventId};
use tracing::debug;

use crate::error::Result;
use crate::storage::EngineStorage;

/// Expands an event into pending deliveries.
///
/// Planning is idempotent: at most one delivery ever exists per
/// (event, target) pair, so re-running it after a crash creates nothing
/// new. Targets that enable or subscribe after planning are not picked up
/// retroactively.
#[derive(Debug, Clone)]
pub struct DeliveryPlanner {
    storage: Arc<dyn EngineStorage>,
    clock: Arc<dyn Clock>,
}

impl DeliveryPlanner {
    /// Creates a planner over the given storage.
    pub fn new(storage: Arc<dyn EngineStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Creates pending deliveries for every enabled target subscribed to
    /// the event's type. Returns how many deliveries were newly created.
    pub async fn plan_deliveries(&self, event_id: EventId) -> Result<usize> {
        let Some(event) = self.storage.find_event(event_id).await? else {
            debug!(event_id = %event_id, "event vanished before planning");
            return Ok(0);
        };

        let targets = self
            .storage
            .list_subscribed_targets(event.account_id, event.event_type)
            .await?;

        let now = self.clock.now_utc();
        let mut created = 0;
        for target in &targets {
            let delivery = Delivery::plan(&event, target, now);
            if self.storage.create_delivery(&delivery).await? {
                created += 1;
            }
        }

        debug!(
            event_id = %event_id,
            event_type = %event.event_type,
            targets = targets.len(),
            created,
            "planned deliveries"
        );
        Ok(created)
    }
}
