//! Per-secret reconciliation: gather state, decide, execute
//!
//! ## Overview
//! - Gather: ledger rows for every replica, source existence + metadata,
//!   per-replica existence
//! - Decide: pure function of the gathered state, yielding
//!   `{NoOp, Sync, Delete}`
//! - Execute: behind the [`ActionExecutor`] capability so the real executor
//!   and the dry-run executor share gather + decide verbatim
//!
//! Gather errors abort the job before any mutation. Execute errors are
//! partial: each cluster reports its own status and failures aggregate into
//! the job-level error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::ledger::LedgerStore;
use crate::syncer::ClusterSyncer;
use crate::types::{
    ClusterSyncStatus, DELETION_FAILURE_VERSION, OutcomeStatus, RecordStatus, SyncedSecret,
};

/// Intended operation for one secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    NoOp,
    Sync { source_version: i64 },
    Delete,
}

/// Everything the decision needs, collected before any mutation.
#[derive(Debug, Default)]
pub struct GatheredState {
    /// Replica names in configuration order.
    pub replicas: Vec<String>,
    /// Ledger rows by replica name; a missing entry means never synced.
    pub records: HashMap<String, SyncedSecret>,
    pub source_exists: bool,
    /// Current source version, when the source exists.
    pub source_version: Option<i64>,
    /// Observed presence per replica; an existence error is logged and
    /// recorded as `false`.
    pub replica_exists: HashMap<String, bool>,
    /// Observed current version per replica, for replicas that exist.
    pub replica_versions: HashMap<String, i64>,
}

/// Decide what to do for one secret.
pub fn decide(state: &GatheredState) -> SyncAction {
    let some_have_records = !state.records.is_empty();
    let all_have_records = state.records.len() == state.replicas.len();

    if !state.source_exists {
        return if some_have_records {
            SyncAction::Delete
        } else {
            SyncAction::NoOp
        };
    }

    let source_version = state.source_version.unwrap_or(0);
    if !all_have_records {
        return SyncAction::Sync { source_version };
    }

    let stale = state.replicas.iter().any(|cluster| {
        let record = state.records.get(cluster);
        let behind = record.is_some_and(|row| row.source_version < source_version);
        let missing = !state.replica_exists.get(cluster).copied().unwrap_or(false);
        // An out-of-band write (or a recorded write failure) leaves the
        // replica's observed version disagreeing with the ledger; replicas
        // are strictly downstream, so reconcile by re-syncing.
        let diverged = record.is_some_and(|row| {
            state
                .replica_versions
                .get(cluster)
                .is_some_and(|observed| Some(*observed) != row.destination_version)
        });
        behind || missing || diverged
    });

    if stale {
        SyncAction::Sync { source_version }
    } else {
        SyncAction::NoOp
    }
}

/// Result of one job: per-cluster statuses plus an optional aggregate of
/// execute-phase failures. The job as a whole still completed.
#[derive(Debug)]
pub struct SyncJobResult {
    pub backend: String,
    pub path: String,
    pub action: SyncAction,
    /// `(cluster, status)` sorted by cluster name.
    pub statuses: Vec<(String, ClusterSyncStatus)>,
    pub error: Option<JobError>,
}

/// Execute capability: the real executor mutates vault and ledger, the
/// dry-run executor only reports intent.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        backend: &str,
        path: &str,
        action: SyncAction,
        state: &GatheredState,
    ) -> (Vec<(String, ClusterSyncStatus)>, Option<JobError>);
}

/// One reconciliation unit for a single `(backend, path)`.
pub struct SyncJob {
    backend: String,
    path: String,
    syncer: Arc<ClusterSyncer>,
    ledger: Arc<dyn LedgerStore>,
    executor: Arc<dyn ActionExecutor>,
}

impl SyncJob {
    pub fn new(
        backend: impl Into<String>,
        path: impl Into<String>,
        syncer: Arc<ClusterSyncer>,
        ledger: Arc<dyn LedgerStore>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            backend: backend.into(),
            path: path.into(),
            syncer,
            ledger,
            executor,
        }
    }

    /// Gather → decide → execute. An `Err` means gathering failed and
    /// nothing was mutated.
    pub async fn run(&self) -> Result<SyncJobResult, JobError> {
        let state = self.gather().await?;
        let action = decide(&state);
        debug!(backend = %self.backend, path = %self.path, ?action, "decision");

        let (statuses, error) = self
            .executor
            .execute(&self.backend, &self.path, action, &state)
            .await;

        Ok(SyncJobResult {
            backend: self.backend.clone(),
            path: self.path.clone(),
            action,
            statuses,
            error,
        })
    }

    async fn gather(&self) -> Result<GatheredState, JobError> {
        let gather_err = |source: anyhow::Error| JobError::StateGather {
            backend: self.backend.clone(),
            path: self.path.clone(),
            source,
        };

        let replicas = self.syncer.replica_names();

        let mut records = HashMap::new();
        for cluster in &replicas {
            match self.ledger.get(&self.backend, &self.path, cluster).await {
                Ok(row) => {
                    records.insert(cluster.clone(), row);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(gather_err(e.into())),
            }
        }

        let source_exists = self
            .syncer
            .secret_exists(&self.backend, &self.path)
            .await
            .map_err(|e| gather_err(e.into()))?;

        let mut state = GatheredState {
            replicas,
            records,
            source_exists,
            ..GatheredState::default()
        };

        if source_exists {
            let metadata = self
                .syncer
                .secret_metadata(&self.backend, &self.path)
                .await
                .map_err(|e| gather_err(e.into()))?;
            state.source_version = Some(metadata.current_version);

            for cluster in state.replicas.clone() {
                let observed = match self
                    .syncer
                    .observe_in_replica(&cluster, &self.backend, &self.path)
                    .await
                {
                    Ok(observed) => observed,
                    Err(e) => {
                        warn!(
                            cluster = %cluster,
                            backend = %self.backend,
                            path = %self.path,
                            error = %e,
                            "replica existence check failed, assuming absent"
                        );
                        None
                    }
                };
                state.replica_exists.insert(cluster.clone(), observed.is_some());
                if let Some(version) = observed {
                    state.replica_versions.insert(cluster, version);
                }
            }
        }

        Ok(state)
    }
}

/// Executor that mutates replicas and reconciles the ledger.
pub struct ApplyExecutor {
    syncer: Arc<ClusterSyncer>,
    ledger: Arc<dyn LedgerStore>,
}

impl ApplyExecutor {
    pub fn new(syncer: Arc<ClusterSyncer>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { syncer, ledger }
    }

    async fn apply_sync(
        &self,
        backend: &str,
        path: &str,
    ) -> (Vec<(String, ClusterSyncStatus)>, Option<JobError>) {
        let outcomes = match self.syncer.sync_to_replicas(backend, path).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                // Nothing was dispatched; every replica's state is unknown.
                let statuses = self
                    .syncer
                    .replica_names()
                    .into_iter()
                    .map(|c| (c, ClusterSyncStatus::Unknown))
                    .collect();
                return (
                    statuses,
                    Some(JobError::SourceRead {
                        backend: backend.to_string(),
                        path: path.to_string(),
                        source: e,
                    }),
                );
            }
        };

        let mut statuses = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();

        for outcome in outcomes {
            let mut status = match outcome.status {
                OutcomeStatus::Success => ClusterSyncStatus::Updated,
                OutcomeStatus::Failed => {
                    failures.push(format!(
                        "write to {} failed: {}",
                        outcome.cluster,
                        outcome.error_message.as_deref().unwrap_or("unknown error")
                    ));
                    ClusterSyncStatus::Failed
                }
            };

            // The row mirrors the outcome field for field.
            let row = SyncedSecret {
                secret_backend: backend.to_string(),
                secret_path: path.to_string(),
                destination_cluster: outcome.cluster.clone(),
                source_version: outcome.source_version,
                destination_version: outcome.destination_version,
                last_sync_attempt: outcome.attempt_time,
                last_sync_success: outcome.success_time,
                status: match outcome.status {
                    OutcomeStatus::Success => RecordStatus::Success,
                    OutcomeStatus::Failed => RecordStatus::Failed,
                },
                error_message: outcome.error_message.clone(),
            };

            if let Err(e) = self.ledger.upsert(&row).await {
                failures.push(format!("ledger upsert for {} failed: {e}", outcome.cluster));
                status = ClusterSyncStatus::Failed;
            }
            statuses.push((outcome.cluster, status));
        }

        let error = (!failures.is_empty()).then(|| JobError::Aggregate(failures));
        (statuses, error)
    }

    async fn apply_delete(
        &self,
        backend: &str,
        path: &str,
    ) -> (Vec<(String, ClusterSyncStatus)>, Option<JobError>) {
        let outcomes = self.syncer.delete_from_replicas(backend, path).await;

        let mut statuses = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();

        for outcome in outcomes {
            let status = match outcome.status {
                OutcomeStatus::Success => {
                    match self.ledger.delete(backend, path, &outcome.cluster).await {
                        Ok(()) => ClusterSyncStatus::Deleted,
                        Err(e) => {
                            failures
                                .push(format!("ledger delete for {} failed: {e}", outcome.cluster));
                            ClusterSyncStatus::Failed
                        }
                    }
                }
                OutcomeStatus::Failed => {
                    failures.push(format!(
                        "delete on {} failed: {}",
                        outcome.cluster,
                        outcome.error_message.as_deref().unwrap_or("unknown error")
                    ));

                    // Keep failure evidence so the next run re-attempts the
                    // delete; sentinel versions mark the row unambiguously.
                    let row = SyncedSecret {
                        secret_backend: backend.to_string(),
                        secret_path: path.to_string(),
                        destination_cluster: outcome.cluster.clone(),
                        source_version: DELETION_FAILURE_VERSION,
                        destination_version: Some(DELETION_FAILURE_VERSION),
                        last_sync_attempt: outcome.attempt_time,
                        last_sync_success: None,
                        status: RecordStatus::Failed,
                        error_message: outcome.error_message.clone(),
                    };

                    if let Err(e) = self.ledger.upsert(&row).await {
                        failures
                            .push(format!("ledger upsert for {} failed: {e}", outcome.cluster));
                    }
                    ClusterSyncStatus::ErrorDeleting
                }
            };
            statuses.push((outcome.cluster, status));
        }

        let error = (!failures.is_empty()).then(|| JobError::Aggregate(failures));
        (statuses, error)
    }
}

#[async_trait]
impl ActionExecutor for ApplyExecutor {
    async fn execute(
        &self,
        backend: &str,
        path: &str,
        action: SyncAction,
        state: &GatheredState,
    ) -> (Vec<(String, ClusterSyncStatus)>, Option<JobError>) {
        match action {
            SyncAction::NoOp => {
                let mut clusters = state.replicas.clone();
                clusters.sort();
                (
                    clusters
                        .into_iter()
                        .map(|c| (c, ClusterSyncStatus::Unmodified))
                        .collect(),
                    None,
                )
            }
            SyncAction::Sync { .. } => self.apply_sync(backend, path).await,
            SyncAction::Delete => self.apply_delete(backend, path).await,
        }
    }
}

/// Non-mutating executor: reports the intended action and version deltas.
pub struct DryRunExecutor;

#[async_trait]
impl ActionExecutor for DryRunExecutor {
    async fn execute(
        &self,
        backend: &str,
        path: &str,
        action: SyncAction,
        state: &GatheredState,
    ) -> (Vec<(String, ClusterSyncStatus)>, Option<JobError>) {
        let mut clusters = state.replicas.clone();
        clusters.sort();

        let statuses = clusters
            .into_iter()
            .map(|cluster| {
                let status = match action {
                    SyncAction::NoOp => ClusterSyncStatus::Unmodified,
                    SyncAction::Sync { source_version } => {
                        let recorded = state
                            .records
                            .get(&cluster)
                            .map(|row| row.source_version.to_string())
                            .unwrap_or_else(|| "none".to_string());
                        info!(
                            backend, path, cluster = %cluster,
                            "dry-run: would sync version {} -> {}",
                            recorded, source_version
                        );
                        ClusterSyncStatus::Pending
                    }
                    SyncAction::Delete => {
                        info!(backend, path, cluster = %cluster, "dry-run: would delete");
                        ClusterSyncStatus::Pending
                    }
                };
                (cluster, status)
            })
            .collect();

        (statuses, None)
    }
}
