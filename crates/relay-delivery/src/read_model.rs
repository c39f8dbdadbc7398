//! Per-target delivery history for operator diagnosis.

use std::sync::Arc;

use relay_core::{DeliveryRecord, TargetId};

use crate::error::Result;
use crate::storage::EngineStorage;

/// Default number of history entries returned.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Read-only view over past and in-flight deliveries.
#[derive(Debug, Clone)]
pub struct DeliveryHistory {
    storage: Arc<dyn EngineStorage>,
}

impl DeliveryHistory {
    /// Creates the read model over shared storage.
    pub fn new(storage: Arc<dyn EngineStorage>) -> Self {
        Self { storage }
    }

    /// Most recent deliveries for a target, newest first, each carrying
    /// its attempt counts, last status code, truncated error text, and the
    /// originating event's type and occurrence time.
    ///
    /// `limit` defaults to [`DEFAULT_HISTORY_LIMIT`]. Pending deliveries
    /// appear alongside terminal ones so an operator sees in-flight work.
    pub async fn list_recent(
        &self,
        target_id: TargetId,
        limit: Option<usize>,
    ) -> Result<Vec<DeliveryRecord>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        Ok(self.storage.list_recent_deliveries(target_id, limit).await?)
    }
}
