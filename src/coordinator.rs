//! Batch reconciliation across every configured mount
//!
//! ## Overview
//! - Pre-flight: verify configured mounts exist on main and every replica
//! - Enumerate candidates: filtered source listings unioned with ledger
//!   pairs so source-deleted secrets are still reconciled
//! - Fan out one sync job per candidate over a bounded worker pool
//! - Collect per-job results into a run summary; a job's failure never
//!   aborts the run
//!
//! The coordinator owns the cancellation token and the overall deadline.
//! Cancelled jobs still produce a result so the summary accounts for every
//! candidate.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{CoordinatorError, JobError};
use crate::filter::PathFilter;
use crate::job::{ActionExecutor, ApplyExecutor, DryRunExecutor, SyncJob, SyncJobResult};
use crate::ledger::LedgerStore;
use crate::syncer::ClusterSyncer;
use crate::types::ClusterSyncStatus;

/// Summary of one batch run.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Number of candidate secrets processed.
    pub jobs: usize,
    /// Per-cluster status counts across all jobs.
    pub status_counts: HashMap<ClusterSyncStatus, usize>,
    /// Per-secret failures: `(backend, path, message)`.
    pub errors: Vec<(String, String, String)>,
    pub elapsed: Duration,
}

impl SyncReport {
    fn absorb(&mut self, result: &SyncJobResult) {
        self.jobs += 1;
        for (_, status) in &result.statuses {
            *self.status_counts.entry(*status).or_default() += 1;
        }
        if let Some(error) = &result.error {
            self.errors
                .push((result.backend.clone(), result.path.clone(), error.to_string()));
        }
    }

    /// Status counts in a stable order for logging.
    pub fn sorted_counts(&self) -> Vec<(ClusterSyncStatus, usize)> {
        let mut counts: Vec<_> = self.status_counts.iter().map(|(s, n)| (*s, *n)).collect();
        counts.sort_by_key(|(s, _)| s.to_string());
        counts
    }
}

pub struct BatchCoordinator {
    syncer: Arc<ClusterSyncer>,
    ledger: Arc<dyn LedgerStore>,
    mounts: Vec<String>,
    filter: PathFilter,
    concurrency: usize,
    cancel: CancellationToken,
    deadline: Option<Duration>,
}

impl BatchCoordinator {
    pub fn new(
        syncer: Arc<ClusterSyncer>,
        ledger: Arc<dyn LedgerStore>,
        mounts: Vec<String>,
        filter: PathFilter,
        concurrency: usize,
    ) -> Self {
        Self {
            syncer,
            ledger,
            mounts,
            filter,
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Apply an overall deadline to the next run.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Token cancelling the run cooperatively, e.g. from a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Verify every configured mount exists on main and on every replica.
    async fn verify_mounts(&self) -> Result<(), CoordinatorError> {
        let mut missing_per_cluster = Vec::new();

        let missing = self
            .syncer
            .main()
            .check_mounts(&self.mounts)
            .await
            .map_err(CoordinatorError::MainCluster)?;
        if !missing.is_empty() {
            missing_per_cluster.push((self.syncer.main().name().to_string(), missing));
        }

        for replica in self.syncer.replicas() {
            let missing = replica.check_mounts(&self.mounts).await.map_err(|source| {
                CoordinatorError::ReplicaCluster {
                    cluster: replica.name().to_string(),
                    source,
                }
            })?;
            if !missing.is_empty() {
                missing_per_cluster.push((replica.name().to_string(), missing));
            }
        }

        if missing_per_cluster.is_empty() {
            Ok(())
        } else {
            Err(CoordinatorError::MissingMounts(missing_per_cluster))
        }
    }

    /// Candidate `(backend, path)` pairs: filtered listings of every
    /// configured mount, unioned with every pair recorded in the ledger so
    /// secrets deleted from the source are not missed.
    async fn candidates(&self) -> Result<Vec<(String, String)>, CoordinatorError> {
        let mut pairs = BTreeSet::new();

        for mount in &self.mounts {
            let keys = self
                .syncer
                .main()
                .list_keys(mount)
                .await
                .map_err(|source| CoordinatorError::Listing {
                    mount: mount.clone(),
                    source,
                })?;
            for key in keys {
                if self.filter.matches(&key) {
                    pairs.insert((mount.clone(), key));
                }
            }
        }

        let rows = self.ledger.list().await.map_err(CoordinatorError::Ledger)?;
        for row in rows {
            pairs.insert((row.secret_backend, row.secret_path));
        }

        Ok(pairs.into_iter().collect())
    }

    /// Run one batch reconciliation. `dry_run` swaps the executor only;
    /// gather and decide are shared.
    pub async fn run(&self, dry_run: bool) -> Result<SyncReport, CoordinatorError> {
        let started = Instant::now();

        self.verify_mounts().await?;
        let candidates = self.candidates().await?;
        info!(candidates = candidates.len(), dry_run, "starting batch sync");

        let executor: Arc<dyn ActionExecutor> = if dry_run {
            Arc::new(DryRunExecutor)
        } else {
            Arc::new(ApplyExecutor::new(
                Arc::clone(&self.syncer),
                Arc::clone(&self.ledger),
            ))
        };

        if let Some(deadline) = self.deadline {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!("run deadline reached, cancelling in-flight jobs");
                cancel.cancel();
            });
        }

        let results: Vec<SyncJobResult> = futures::stream::iter(candidates)
            .map(|(backend, path)| {
                let job = SyncJob::new(
                    backend.clone(),
                    path.clone(),
                    Arc::clone(&self.syncer),
                    Arc::clone(&self.ledger),
                    Arc::clone(&executor),
                );
                let cancel = self.cancel.clone();
                let replicas = self.syncer.replica_names();
                async move {
                    match cancel.run_until_cancelled(job.run()).await {
                        Some(Ok(result)) => result,
                        Some(Err(e)) => {
                            error!(backend = %backend, path = %path, error = %e, "job aborted");
                            SyncJobResult {
                                backend,
                                path,
                                action: crate::job::SyncAction::NoOp,
                                statuses: Vec::new(),
                                error: Some(e),
                            }
                        }
                        // Cancelled mid-flight: report what we know so the
                        // summary covers every candidate.
                        None => SyncJobResult {
                            backend: backend.clone(),
                            path: path.clone(),
                            action: crate::job::SyncAction::NoOp,
                            statuses: replicas
                                .into_iter()
                                .map(|c| (c, ClusterSyncStatus::Failed))
                                .collect(),
                            error: Some(JobError::Aggregate(vec!["run cancelled".to_string()])),
                        },
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = SyncReport::default();
        for result in &results {
            report.absorb(result);
        }
        report.elapsed = started.elapsed();

        for (status, count) in report.sorted_counts() {
            info!(%status, count, "run status count");
        }
        info!(
            jobs = report.jobs,
            errors = report.errors.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch sync complete"
        );

        Ok(report)
    }
}
