//! Outbound webhook delivery engine.
//!
//! Turns stored domain events into signed HTTP POSTs against
//! user-configured targets, with account-scoped deduplication on intake,
//! one delivery per subscribed target, bounded retries with exponential
//! backoff and jitter, and per-target health bookkeeping.
//!
//! The moving parts:
//! - [`EventIngress`] accepts and deduplicates events,
//! - [`DeliveryPlanner`] fans each event out into pending deliveries,
//! - [`DeliveryEngine`] runs the worker pool that claims due deliveries,
//! - [`Dispatcher`] executes single attempts and decides retry or failure,
//! - [`DeliveryHistory`] exposes recent per-target history.
//!
//! Persistence sits behind [`EngineStorage`], with a Postgres adapter for
//! production and an in-memory store for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod ingress;
pub mod planner;
pub mod read_model;
pub mod retry;
pub mod signing;
pub mod storage;

pub use client::{ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use engine::{DeliveryEngine, EngineConfig, EngineStats};
pub use envelope::Envelope;
pub use error::{DeliveryError, Result};
pub use ingress::{EventIngress, NewEvent, SubmitReceipt};
pub use planner::DeliveryPlanner;
pub use read_model::{DeliveryHistory, DEFAULT_HISTORY_LIMIT};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{EngineStorage, PostgresEngineStorage};
