//! Core domain models, errors, and storage for the relay webhook
//! forwarder.
//!
//! Provides strongly-typed domain primitives and the PostgreSQL
//! repository layer. The delivery engine crate depends on these
//! foundational types for type safety and consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AccountId, Delivery, DeliveryId, DeliveryRecord, DeliveryStatus, Event, EventId, EventSource,
    EventType, Target, TargetId,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
