//! Relay webhook delivery service.
//!
//! Wires the Postgres-backed storage layer to the delivery engine and
//! runs the worker pool until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relay_core::RealClock;
use relay_delivery::{DeliveryEngine, EngineConfig, PostgresEngineStorage};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting relay webhook delivery service");

    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        workers = config.engine.worker_count,
        batch_size = config.engine.batch_size,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    ensure_schema(&db_pool).await?;
    info!("Database schema ready");

    let storage = Arc::new(relay_core::Storage::new(db_pool.clone()));
    let engine_storage = Arc::new(PostgresEngineStorage::new(storage));
    let mut engine = DeliveryEngine::new(
        engine_storage,
        config.engine.clone(),
        Arc::new(RealClock::new()),
    )?;
    engine.start();

    info!("Relay is dispatching deliveries");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    engine.shutdown().await;

    db_pool.close().await;
    info!("Database connections closed");

    info!("Relay shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,relay=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates the tables and indexes the engine relies on.
async fn ensure_schema(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id UUID PRIMARY KEY,
            account_id UUID NOT NULL,
            event_type TEXT NOT NULL,
            source TEXT NOT NULL,
            occurred_at TIMESTAMPTZ NOT NULL,
            payload JSONB NOT NULL,
            dedupe_key TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create events table")?;

    // One event per (account, dedupe key); the ingress depends on this
    // index for idempotent submission.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_events_dedupe
        ON events(account_id, dedupe_key)
        WHERE dedupe_key IS NOT NULL
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create events dedupe index")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS targets (
            id UUID PRIMARY KEY,
            account_id UUID NOT NULL,
            url TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            subscribed_events TEXT[] NOT NULL DEFAULT '{}',
            signing_secret TEXT NOT NULL,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            timeout_ms INTEGER NOT NULL DEFAULT 10000,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_delivery_at TIMESTAMPTZ,
            last_success_at TIMESTAMPTZ,
            last_failure_at TIMESTAMPTZ,
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create targets table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deliveries (
            id UUID PRIMARY KEY,
            account_id UUID NOT NULL,
            event_id UUID NOT NULL REFERENCES events(id),
            target_id UUID NOT NULL REFERENCES targets(id),
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_attempt_at TIMESTAMPTZ,
            last_attempt_at TIMESTAMPTZ,
            last_status_code INTEGER,
            last_error TEXT,
            last_response_snippet TEXT,
            delivered_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE(event_id, target_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create deliveries table")?;

    // Partial index on due work keeps the claim query cheap as terminal
    // rows accumulate.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_deliveries_due
        ON deliveries(next_attempt_at)
        WHERE status = 'pending' AND next_attempt_at IS NOT NULL
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create deliveries due index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_deliveries_target
        ON deliveries(target_id, last_attempt_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create deliveries target index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Service configuration.
struct Config {
    /// PostgreSQL connection string
    database_url: String,
    /// Maximum database connections
    database_max_connections: u32,
    /// Delivery engine tuning
    engine: EngineConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let mut engine = EngineConfig::default();
        if let Some(workers) = env_parse("RELAY_WORKERS") {
            engine.worker_count = workers;
        }
        if let Some(batch_size) = env_parse("RELAY_BATCH_SIZE") {
            engine.batch_size = batch_size;
        }
        if let Some(poll_ms) = env_parse("RELAY_POLL_INTERVAL_MS") {
            engine.poll_interval = Duration::from_millis(poll_ms);
        }

        Ok(Self { database_url, database_max_connections, engine })
    }

    /// Returns database URL with password masked for logging.
    fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(password_start) = self.database_url[..at_pos].rfind(':') {
                if let Some(user_start) = self.database_url[..password_start].rfind('/') {
                    return format!(
                        "{}//{}:***@{}",
                        &self.database_url[..user_start],
                        &self.database_url[user_start + 2..password_start],
                        &self.database_url[at_pos + 1..]
                    );
                }
            }
        }
        // Fallback: just return postgresql://***
        "postgresql://***".to_string()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
