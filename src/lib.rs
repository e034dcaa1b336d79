//! Vault secret replication with a durable sync ledger
//!
//! Replicates versioned key-value secrets from a single authoritative
//! **main** cluster to any number of **replica** clusters, recording what
//! has been propagated in a Postgres ledger so subsequent runs converge on
//! the correct state with minimal work.
//!
//! # Architecture
//!
//! - [`client`]: HTTP transport for one cluster (token header, response
//!   envelope handling, error classification)
//! - [`session`]: per-cluster AppRole login and TTL-driven token refresh,
//!   plus the KV operations (list, read, write, delete)
//! - [`syncer`]: the multi-cluster facade fanning writes and deletes out to
//!   every replica concurrently with partial-failure accounting
//! - [`ledger`]: the durable sync record, every operation guarded by a
//!   circuit breaker with retries inside it
//! - [`job`]: the per-secret state machine (gather → decide → execute)
//! - [`coordinator`]: candidate enumeration and the bounded worker pool for
//!   one batch run
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vault_sync::config::Config;
//! use vault_sync::coordinator::BatchCoordinator;
//! use vault_sync::filter::PathFilter;
//! use vault_sync::ledger::PgLedger;
//! use vault_sync::session::ClusterSession;
//! use vault_sync::syncer::ClusterSyncer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.yaml")?;
//!
//! let main = ClusterSession::new(&config.vault.main_cluster)?;
//! let replicas = config
//!     .vault
//!     .replica_clusters
//!     .iter()
//!     .map(ClusterSession::new)
//!     .collect::<Result<Vec<_>, _>>()?;
//!
//! let syncer = Arc::new(ClusterSyncer::new(main, replicas, config.concurrency));
//! let ledger = Arc::new(PgLedger::connect(&config.postgres).await?);
//! let filter = PathFilter::new(
//!     &config.sync_rule.paths_to_replicate,
//!     &config.sync_rule.paths_to_ignore,
//! )?;
//!
//! let coordinator = BatchCoordinator::new(
//!     syncer,
//!     ledger,
//!     config.sync_rule.kv_mounts.clone(),
//!     filter,
//!     config.concurrency,
//! );
//! let report = coordinator.run(false).await?;
//! println!("synced {} secrets, {} errors", report.jobs, report.errors.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Replication semantics
//!
//! The main cluster is read-only source of truth; it is never written to.
//! For each candidate secret the job compares the source's current version
//! against the ledger rows and replica state, then syncs, deletes, or does
//! nothing. Failed replica deletions keep their ledger row as evidence
//! (with sentinel versions) so the next run re-attempts them. Absence of a
//! ledger row for a cluster means the secret was never successfully written
//! there.

pub mod breaker;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod job;
pub mod ledger;
pub mod session;
pub mod syncer;
pub mod types;

// Core client and error types
pub use client::{VaultClient, VaultClientBuilder};
pub use error::{CoordinatorError, JobError, LedgerError, Result, VaultError};

// Cluster access
pub use session::ClusterSession;
pub use syncer::ClusterSyncer;

// Ledger
pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use ledger::{LedgerGuard, LedgerStore, PgLedger, RetryPolicy};

// Reconciliation
pub use coordinator::{BatchCoordinator, SyncReport};
pub use filter::PathFilter;
pub use job::{ActionExecutor, ApplyExecutor, DryRunExecutor, SyncAction, SyncJob, SyncJobResult};

// Models
pub use types::{
    ClusterSyncStatus, DELETION_FAILURE_VERSION, DeleteOutcome, OutcomeStatus, RecordStatus,
    SecretData, SecretMetadata, SecretVersion, SyncedSecret, WriteOutcome,
};
