//! Multi-cluster facade: one main session plus ordered replica sessions
//!
//! ## Overview
//! - Source reads go to the main cluster only; it is never written to
//! - Writes and deletes fan out to every replica concurrently, bounded by
//!   the configured concurrency
//! - One replica's failure never cancels its siblings; per-replica outcomes
//!   carry their own status and timestamps
//! - Outcomes are returned sorted by cluster name so callers and tests see a
//!   deterministic order

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::{Result, VaultError};
use crate::session::ClusterSession;
use crate::types::{DeleteOutcome, OutcomeStatus, SecretMetadata, WriteOutcome};

pub struct ClusterSyncer {
    main: Arc<ClusterSession>,
    /// Insertion order is configuration order.
    replicas: Vec<Arc<ClusterSession>>,
    concurrency: usize,
}

impl ClusterSyncer {
    pub fn new(main: ClusterSession, replicas: Vec<ClusterSession>, concurrency: usize) -> Self {
        Self {
            main: Arc::new(main),
            replicas: replicas.into_iter().map(Arc::new).collect(),
            concurrency: concurrency.max(1),
        }
    }

    /// The main session, for coordinator-level mount checks and listings.
    pub fn main(&self) -> &ClusterSession {
        &self.main
    }

    /// Replica sessions in configuration order.
    pub fn replicas(&self) -> impl Iterator<Item = &ClusterSession> {
        self.replicas.iter().map(Arc::as_ref)
    }

    /// Replica cluster names in configuration order.
    pub fn replica_names(&self) -> Vec<String> {
        self.replicas.iter().map(|r| r.name().to_string()).collect()
    }

    fn replica(&self, cluster: &str) -> Result<&Arc<ClusterSession>> {
        self.replicas
            .iter()
            .find(|r| r.name() == cluster)
            .ok_or_else(|| VaultError::RequestFailed(format!("unknown replica cluster: {cluster}")))
    }

    /// Whether the secret is present on the main cluster.
    pub async fn secret_exists(&self, mount: &str, path: &str) -> Result<bool> {
        self.main.secret_exists(mount, path).await
    }

    /// Whether the secret is present on a named replica.
    pub async fn secret_exists_in_replica(
        &self,
        cluster: &str,
        mount: &str,
        path: &str,
    ) -> Result<bool> {
        self.replica(cluster)?.secret_exists(mount, path).await
    }

    /// Observed current version on a named replica, `None` when absent.
    pub async fn observe_in_replica(
        &self,
        cluster: &str,
        mount: &str,
        path: &str,
    ) -> Result<Option<i64>> {
        self.replica(cluster)?.observe_secret(mount, path).await
    }

    /// Versioned metadata from the main cluster. Absence surfaces as
    /// [`VaultError::NotFound`], distinguishable from transport failure via
    /// `is_not_found()`.
    pub async fn secret_metadata(&self, mount: &str, path: &str) -> Result<SecretMetadata> {
        self.main.read_metadata(mount, path).await
    }

    /// Read the secret once from main, then write it to every replica.
    ///
    /// Returns an error only when the source read fails; per-replica write
    /// failures are recorded in their outcomes.
    pub async fn sync_to_replicas(&self, mount: &str, path: &str) -> Result<Vec<WriteOutcome>> {
        let (data, source_version) = self.main.read_current(mount, path).await?;
        let data = Arc::new(data);

        let mut outcomes: Vec<WriteOutcome> = futures::stream::iter(self.replicas.iter().cloned())
            .map(|replica| {
                let data = Arc::clone(&data);
                async move {
                    let result = replica.write(mount, path, &data).await;
                    // Recorded at completion so a success stamp never
                    // exceeds the attempt stamp.
                    let attempt_time = Utc::now();
                    match result {
                        Ok(destination_version) => {
                            debug!(
                                cluster = replica.name(),
                                mount, path, destination_version, "replica write ok"
                            );
                            WriteOutcome {
                                cluster: replica.name().to_string(),
                                status: OutcomeStatus::Success,
                                source_version,
                                destination_version: Some(destination_version),
                                error_message: None,
                                attempt_time,
                                success_time: Some(attempt_time),
                            }
                        }
                        Err(e) => {
                            warn!(cluster = replica.name(), mount, path, error = %e, "replica write failed");
                            WriteOutcome {
                                cluster: replica.name().to_string(),
                                status: OutcomeStatus::Failed,
                                source_version,
                                destination_version: None,
                                error_message: Some(e.to_string()),
                                attempt_time,
                                success_time: None,
                            }
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        outcomes.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        Ok(outcomes)
    }

    /// Attempt deletion on every replica with the same partial-success
    /// semantics as [`ClusterSyncer::sync_to_replicas`].
    pub async fn delete_from_replicas(&self, mount: &str, path: &str) -> Vec<DeleteOutcome> {
        let mut outcomes: Vec<DeleteOutcome> = futures::stream::iter(self.replicas.iter().cloned())
            .map(|replica| async move {
                let result = replica.delete(mount, path).await;
                let attempt_time = Utc::now();
                match result {
                    Ok(()) => {
                        debug!(cluster = replica.name(), mount, path, "replica delete ok");
                        DeleteOutcome {
                            cluster: replica.name().to_string(),
                            status: OutcomeStatus::Success,
                            error_message: None,
                            attempt_time,
                        }
                    }
                    Err(e) => {
                        warn!(cluster = replica.name(), mount, path, error = %e, "replica delete failed");
                        DeleteOutcome {
                            cluster: replica.name().to_string(),
                            status: OutcomeStatus::Failed,
                            error_message: Some(e.to_string()),
                            attempt_time,
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        outcomes.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        outcomes
    }
}
