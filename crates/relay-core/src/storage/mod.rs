//! Database access layer implementing the repository pattern.
//!
//! The repositories translate between domain models and the PostgreSQL
//! schema. All database operations go through this module; the delivery
//! engine never issues SQL of its own.

use std::sync::Arc;

use sqlx::PgPool;

pub mod deliveries;
pub mod events;
pub mod targets;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Debug, Clone)]
pub struct Storage {
    /// Repository for immutable domain events.
    pub events: Arc<events::Repository>,

    /// Repository for webhook target configuration and bookkeeping.
    pub targets: Arc<targets::Repository>,

    /// Repository for delivery state tracking.
    pub deliveries: Arc<deliveries::Repository>,
}

impl Storage {
    /// Creates a new storage instance over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            events: Arc::new(events::Repository::new(pool.clone())),
            targets: Arc::new(targets::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity with a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.events.pool()).await?;
        Ok(())
    }
}
