//! Durable sync ledger over Postgres
//!
//! ## Overview
//! - One row per `(secret_backend, secret_path, destination_cluster)`
//! - Every operation runs behind a shared circuit breaker; inside the
//!   breaker, the raw database call retries with exponential backoff, so the
//!   breaker counts one logical operation regardless of attempts
//! - Open breaker maps to [`LedgerError::Unavailable`]; anything else that
//!   survives the retries maps to [`LedgerError::Generic`]; a row miss on
//!   `get` maps to [`LedgerError::NotFound`]
//!
//! The schema is applied at startup by the embedded migration runner.

use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::breaker::{BreakerSettings, CircuitBreaker};
use crate::config::PostgresConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::types::SyncedSecret;

/// Default connection pool size when `max_connections` is not configured.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Durable record store for what has been propagated where.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fetch one row by its key triple.
    async fn get(&self, backend: &str, path: &str, cluster: &str) -> LedgerResult<SyncedSecret>;

    /// All rows, sorted by `(backend, path, cluster)`.
    async fn list(&self) -> LedgerResult<Vec<SyncedSecret>>;

    /// Insert-or-update keyed by the triple; overwrites all mutable fields.
    async fn upsert(&self, row: &SyncedSecret) -> LedgerResult<()>;

    /// Remove one row. Deleting a non-existent row is not an error.
    async fn delete(&self, backend: &str, path: &str, cluster: &str) -> LedgerResult<()>;

    /// Release underlying resources.
    async fn close(&self);
}

/// Retry schedule applied inside the breaker.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Jitter as a fraction of the current interval.
    pub randomization_factor: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

/// Breaker + retry composition shared by every ledger operation.
pub struct LedgerGuard {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl LedgerGuard {
    pub fn new(breaker: CircuitBreaker, retry: RetryPolicy) -> Self {
        Self { breaker, retry }
    }

    /// Run one logical operation: admit it through the breaker, retry the
    /// inner call with backoff, then report a single outcome to the breaker.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> LedgerResult<T>
    where
        E: Display,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self
            .breaker
            .try_acquire()
            .map_err(|_| LedgerError::Unavailable("circuit breaker open".to_string()))?;

        let backoff = backoff::ExponentialBackoff {
            initial_interval: self.retry.initial_interval,
            multiplier: self.retry.multiplier,
            randomization_factor: self.retry.randomization_factor,
            max_interval: self.retry.max_interval,
            max_elapsed_time: Some(self.retry.max_elapsed),
            ..backoff::ExponentialBackoff::default()
        };

        let attempts = AtomicU32::new(0);
        let max_attempts = self.retry.max_attempts;
        let result = backoff::future::retry(backoff, || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            op().await.map_err(|e| {
                debug!(attempt, error = %e, "ledger operation attempt failed");
                if attempt >= max_attempts {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        })
        .await;

        match result {
            Ok(value) => {
                self.breaker.record(generation, true);
                Ok(value)
            }
            Err(e) => {
                self.breaker.record(generation, false);
                Err(LedgerError::Generic(e.to_string()))
            }
        }
    }
}

/// Postgres-backed ledger.
pub struct PgLedger {
    pool: PgPool,
    guard: LedgerGuard,
}

impl PgLedger {
    /// Connect, apply pending migrations, and wrap the pool in the default
    /// resilience policy.
    pub async fn connect(config: &PostgresConfig) -> LedgerResult<Self> {
        let options = config
            .connect_options()
            .map_err(|e| LedgerError::Generic(e.to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| LedgerError::Generic(format!("migration failed: {e}")))?;
        info!("ledger schema up to date");

        Ok(Self::with_pool(pool))
    }

    /// Wrap an existing pool with the default breaker and retry policy.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            guard: LedgerGuard::new(
                CircuitBreaker::new("ledger", BreakerSettings::default()),
                RetryPolicy::default(),
            ),
        }
    }
}

fn validate_key(backend: &str, path: &str, cluster: &str) -> LedgerResult<()> {
    if backend.is_empty() || path.is_empty() || cluster.is_empty() {
        return Err(LedgerError::InvalidParameters(format!(
            "backend, path and cluster must be non-empty (got \"{backend}\", \"{path}\", \"{cluster}\")"
        )));
    }
    Ok(())
}

const SELECT_COLUMNS: &str = "secret_backend, secret_path, source_version, destination_cluster, \
     destination_version, last_sync_attempt, last_sync_success, status, error_message";

#[async_trait]
impl LedgerStore for PgLedger {
    async fn get(&self, backend: &str, path: &str, cluster: &str) -> LedgerResult<SyncedSecret> {
        validate_key(backend, path, cluster)?;

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM synced_secrets \
             WHERE secret_backend = $1 AND secret_path = $2 AND destination_cluster = $3"
        );
        let row = self
            .guard
            .run(|| {
                sqlx::query_as::<_, SyncedSecret>(&sql)
                    .bind(backend)
                    .bind(path)
                    .bind(cluster)
                    .fetch_optional(&self.pool)
            })
            .await?;

        row.ok_or(LedgerError::NotFound)
    }

    async fn list(&self) -> LedgerResult<Vec<SyncedSecret>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM synced_secrets \
             ORDER BY secret_backend, secret_path, destination_cluster"
        );
        self.guard
            .run(|| sqlx::query_as::<_, SyncedSecret>(&sql).fetch_all(&self.pool))
            .await
    }

    async fn upsert(&self, row: &SyncedSecret) -> LedgerResult<()> {
        validate_key(&row.secret_backend, &row.secret_path, &row.destination_cluster)?;

        self.guard
            .run(|| {
                sqlx::query(
                    "INSERT INTO synced_secrets \
                     (secret_backend, secret_path, source_version, destination_cluster, \
                      destination_version, last_sync_attempt, last_sync_success, status, error_message) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     ON CONFLICT (secret_backend, secret_path, destination_cluster) DO UPDATE SET \
                       source_version = EXCLUDED.source_version, \
                       destination_version = EXCLUDED.destination_version, \
                       last_sync_attempt = EXCLUDED.last_sync_attempt, \
                       last_sync_success = EXCLUDED.last_sync_success, \
                       status = EXCLUDED.status, \
                       error_message = EXCLUDED.error_message",
                )
                .bind(&row.secret_backend)
                .bind(&row.secret_path)
                .bind(row.source_version)
                .bind(&row.destination_cluster)
                .bind(row.destination_version)
                .bind(row.last_sync_attempt)
                .bind(row.last_sync_success)
                .bind(row.status.to_string())
                .bind(&row.error_message)
                .execute(&self.pool)
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, backend: &str, path: &str, cluster: &str) -> LedgerResult<()> {
        validate_key(backend, path, cluster)?;

        self.guard
            .run(|| {
                sqlx::query(
                    "DELETE FROM synced_secrets \
                     WHERE secret_backend = $1 AND secret_path = $2 AND destination_cluster = $3",
                )
                .bind(backend)
                .bind(path)
                .bind(cluster)
                .execute(&self.pool)
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(2),
            max_elapsed: Duration::from_secs(1),
            max_attempts,
        }
    }

    fn tight_breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test-ledger",
            BreakerSettings {
                max_probes: 1,
                interval: Duration::from_secs(30),
                cooldown: Duration::from_millis(50),
                min_requests: 2,
                failure_ratio: 0.5,
            },
        )
    }

    #[tokio::test]
    async fn retries_until_success() {
        let guard = LedgerGuard::new(tight_breaker(), fast_retry(10));
        let calls = AtomicUsize::new(0);

        let result = guard
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_cap_maps_to_generic() {
        let guard = LedgerGuard::new(tight_breaker(), fast_retry(3));
        let calls = AtomicUsize::new(0);

        let result: LedgerResult<()> = guard
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            })
            .await;

        assert!(matches!(result, Err(LedgerError::Generic(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_invoking_op() {
        let guard = LedgerGuard::new(tight_breaker(), fast_retry(1));

        for _ in 0..2 {
            let _: LedgerResult<()> = guard.run(|| async { Err("down") }).await;
        }

        let calls = AtomicUsize::new(0);
        let result: LedgerResult<()> = guard
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(()) }
            })
            .await;

        assert!(matches!(result, Err(LedgerError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn breaker_recovers_after_cooldown_probe() {
        let guard = LedgerGuard::new(tight_breaker(), fast_retry(1));

        for _ in 0..2 {
            let _: LedgerResult<()> = guard.run(|| async { Err("down") }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = guard.run(|| async { Ok::<_, &str>(7) }).await;
        assert_eq!(result.unwrap(), 7);

        // Closed again: normal operations resume.
        let result = guard.run(|| async { Ok::<_, &str>(8) }).await;
        assert_eq!(result.unwrap(), 8);
    }

    #[test]
    fn empty_key_component_is_invalid() {
        assert!(matches!(
            validate_key("", "path", "cluster"),
            Err(LedgerError::InvalidParameters(_))
        ));
        assert!(matches!(
            validate_key("backend", "", "cluster"),
            Err(LedgerError::InvalidParameters(_))
        ));
        assert!(matches!(
            validate_key("backend", "path", ""),
            Err(LedgerError::InvalidParameters(_))
        ));
        assert!(validate_key("backend", "path", "cluster").is_ok());
    }
}
