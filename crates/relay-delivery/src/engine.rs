//! Delivery engine: a pool of workers claiming and dispatching due
//! deliveries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use relay_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientConfig, DeliveryClient};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::storage::EngineStorage;

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default number of deliveries claimed per polling pass.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent workers.
    pub worker_count: usize,
    /// Deliveries claimed per worker per pass.
    pub batch_size: usize,
    /// Sleep between empty polling passes.
    pub poll_interval: Duration,
    /// How long a claim holds a delivery before it becomes due again.
    /// Must comfortably exceed the largest target timeout.
    pub claim_lease: Duration,
    /// Grace period for workers to finish during shutdown.
    pub shutdown_timeout: Duration,
    /// HTTP client settings.
    pub client: ClientConfig,
    /// Backoff settings for failed attempts.
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            claim_lease: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            client: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Monotonic counters shared by all workers.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Deliveries dispatched, regardless of outcome.
    pub dispatched: AtomicU64,
    /// Attempts that ended in terminal success.
    pub succeeded: AtomicU64,
    /// Attempts that scheduled a retry.
    pub retried: AtomicU64,
    /// Attempts that ended in terminal failure.
    pub failed: AtomicU64,
    /// Dispatch passes that errored before reaching an outcome.
    pub errors: AtomicU64,
}

impl EngineStats {
    fn record(&self, outcome: &DispatchOutcome) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        match outcome {
            DispatchOutcome::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
            DispatchOutcome::Scheduled { .. } => self.retried.fetch_add(1, Ordering::Relaxed),
            DispatchOutcome::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            DispatchOutcome::Skipped => 0,
        };
    }
}

/// Background delivery engine.
///
/// Owns the worker pool. Workers poll storage for due deliveries, claim
/// them under a lease, and hand each one to the dispatcher. Dropping the
/// engine without calling [`DeliveryEngine::shutdown`] aborts workers
/// mid-flight; claimed deliveries then resurface when their lease expires.
#[derive(Debug)]
pub struct DeliveryEngine {
    config: EngineConfig,
    storage: Arc<dyn EngineStorage>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    stats: Arc<EngineStats>,
    cancellation: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl DeliveryEngine {
    /// Builds an engine over the given storage. Workers are not started
    /// until [`DeliveryEngine::start`].
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = DeliveryClient::new(&config.client)?;
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&storage),
            client,
            config.retry_policy,
            Arc::clone(&clock),
        ));
        Ok(Self {
            config,
            storage,
            dispatcher,
            clock,
            stats: Arc::new(EngineStats::default()),
            cancellation: CancellationToken::new(),
            workers: Vec::new(),
        })
    }

    /// Spawns the worker pool.
    pub fn start(&mut self) {
        info!(
            workers = self.config.worker_count,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting delivery engine"
        );
        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker {
                worker_id,
                storage: Arc::clone(&self.storage),
                dispatcher: Arc::clone(&self.dispatcher),
                clock: Arc::clone(&self.clock),
                stats: Arc::clone(&self.stats),
                batch_size: self.config.batch_size,
                poll_interval: self.config.poll_interval,
                claim_lease: self.config.claim_lease,
                cancellation: self.cancellation.clone(),
            };
            self.workers.push(tokio::spawn(worker.run()));
        }
    }

    /// Shared stats handle.
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Dispatcher handle, for callers that want to push a single delivery
    /// through outside the polling loop.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Stops the worker pool, waiting up to the configured grace period
    /// for in-flight attempts to finish.
    pub async fn shutdown(mut self) {
        info!("shutting down delivery engine");
        self.cancellation.cancel();
        let drain = async {
            for handle in self.workers.drain(..) {
                if let Err(join_error) = handle.await {
                    error!(%join_error, "delivery worker panicked");
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("shutdown grace period elapsed with workers still running");
        }
        info!(
            dispatched = self.stats.dispatched.load(Ordering::Relaxed),
            succeeded = self.stats.succeeded.load(Ordering::Relaxed),
            retried = self.stats.retried.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "delivery engine stopped"
        );
    }
}

struct DeliveryWorker {
    worker_id: usize,
    storage: Arc<dyn EngineStorage>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    stats: Arc<EngineStats>,
    batch_size: usize,
    poll_interval: Duration,
    claim_lease: Duration,
    cancellation: CancellationToken,
}

impl DeliveryWorker {
    async fn run(self) {
        debug!(worker_id = self.worker_id, "delivery worker started");
        loop {
            tokio::select! {
                () = self.cancellation.cancelled() => break,
                claimed = self.process_batch() => {
                    match claimed {
                        Ok(0) => {
                            tokio::select! {
                                () = self.cancellation.cancelled() => break,
                                () = self.clock.sleep(self.poll_interval) => {}
                            }
                        }
                        Ok(_) => {}
                        Err(error) => {
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(worker_id = self.worker_id, %error, "delivery batch failed");
                            tokio::select! {
                                () = self.cancellation.cancelled() => break,
                                () = self.clock.sleep(self.poll_interval) => {}
                            }
                        }
                    }
                }
            }
        }
        debug!(worker_id = self.worker_id, "delivery worker stopped");
    }

    /// Claims one batch of due deliveries and dispatches them in order.
    /// Returns how many deliveries were claimed.
    async fn process_batch(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let lease_until = now
            + ChronoDuration::from_std(self.claim_lease)
                .unwrap_or_else(|_| ChronoDuration::minutes(2));
        let claimed = self
            .storage
            .claim_due_deliveries(self.batch_size, now, lease_until)
            .await?;
        let count = claimed.len();

        for delivery_id in claimed {
            if self.cancellation.is_cancelled() {
                // Unfinished claims resurface when the lease expires.
                break;
            }
            match self.dispatcher.dispatch(delivery_id).await {
                Ok(outcome) => self.stats.record(&outcome),
                Err(error) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        worker_id = self.worker_id,
                        delivery_id = %delivery_id,
                        %error,
                        "dispatch error"
                    );
                }
            }
        }
        Ok(count)
    }
}
