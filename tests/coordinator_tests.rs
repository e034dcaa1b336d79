//! Batch coordinator tests: pre-flight checks, candidate enumeration, runs

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use vault_sync::coordinator::BatchCoordinator;
use vault_sync::error::CoordinatorError;
use vault_sync::filter::PathFilter;
use vault_sync::session::ClusterSession;
use vault_sync::syncer::ClusterSyncer;
use vault_sync::types::{ClusterSyncStatus, RecordStatus, SyncedSecret};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

struct Fixture {
    main: MockServer,
    replica1: MockServer,
    replica2: MockServer,
    syncer: Arc<ClusterSyncer>,
    ledger: Arc<MemoryLedger>,
}

impl Fixture {
    async fn new() -> Self {
        let main = MockServer::start().await;
        let replica1 = MockServer::start().await;
        let replica2 = MockServer::start().await;
        for server in [&main, &replica1, &replica2] {
            mock_auth(server).await;
        }

        let syncer = Arc::new(ClusterSyncer::new(
            ClusterSession::new(&cluster_config("main", main.uri())).unwrap(),
            vec![
                ClusterSession::new(&cluster_config("replica1", replica1.uri())).unwrap(),
                ClusterSession::new(&cluster_config("replica2", replica2.uri())).unwrap(),
            ],
            4,
        ));

        Self {
            main,
            replica1,
            replica2,
            syncer,
            ledger: Arc::new(MemoryLedger::new()),
        }
    }

    fn coordinator(&self, replicate: &[&str]) -> BatchCoordinator {
        let filter = PathFilter::new(
            &replicate.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &[],
        )
        .unwrap();
        BatchCoordinator::new(
            Arc::clone(&self.syncer),
            self.ledger.clone(),
            vec!["kv".to_string()],
            filter,
            4,
        )
    }

    async fn mock_replica_mounts(&self) {
        for server in [&self.replica1, &self.replica2] {
            Mock::given(method("GET"))
                .and(path("/v1/sys/mounts"))
                .respond_with(success_response(mounts_body(&["kv"])))
                .mount(server)
                .await;
        }
    }
}

#[tokio::test]
async fn missing_replica_mount_aborts_before_any_sync() {
    let fx = Fixture::new().await;

    mock_listing(&fx.main, "kv", &["team-a/secret1"]).await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/mounts"))
        .respond_with(success_response(mounts_body(&["kv"])))
        .mount(&fx.replica1)
        .await;
    // replica2 has no kv mount configured.
    Mock::given(method("GET"))
        .and(path("/v1/sys/mounts"))
        .respond_with(success_response(mounts_body(&["other"])))
        .mount(&fx.replica2)
        .await;

    let err = fx.coordinator(&["team-a/**"]).run(false).await.unwrap_err();

    match err {
        CoordinatorError::MissingMounts(missing) => {
            assert_eq!(
                missing,
                vec![("replica2".to_string(), vec!["kv".to_string()])]
            );
        }
        other => panic!("expected MissingMounts, got {other}"),
    }

    // Nothing was synced.
    let writes: usize = fx
        .replica1
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method == "POST" && !r.url.path().contains("/login"))
        .count();
    assert_eq!(writes, 0);
}

#[tokio::test]
async fn run_syncs_filtered_candidates_and_reports_counts() {
    let fx = Fixture::new().await;
    fx.mock_replica_mounts().await;

    // team-b/other is filtered out by the replicate patterns.
    mock_listing(&fx.main, "kv", &["team-a/secret1", "team-b/other"]).await;
    mock_secret(&fx.main, "kv", "team-a/secret1", json!({ "k": "v" }), 1).await;
    mock_write(&fx.replica1, "kv", "team-a/secret1", 1).await;
    mock_write(&fx.replica2, "kv", "team-a/secret1", 1).await;

    let report = fx.coordinator(&["team-a/**"]).run(false).await.unwrap();

    assert_eq!(report.jobs, 1);
    assert_eq!(
        report.status_counts.get(&ClusterSyncStatus::Updated),
        Some(&2)
    );
    assert!(report.errors.is_empty());
    assert_eq!(fx.ledger.rows().len(), 2);
}

#[tokio::test]
async fn ledger_pairs_are_reconciled_even_when_gone_from_source() {
    let fx = Fixture::new().await;
    fx.mock_replica_mounts().await;

    // The source listing is empty, but the ledger remembers a secret that
    // was replicated before being deleted from the source.
    mock_listing(&fx.main, "kv", &[]).await;
    for cluster in ["replica1", "replica2"] {
        fx.ledger.insert(
            SyncedSecret::builder()
                .secret_backend("kv")
                .secret_path("team-a/removed")
                .destination_cluster(cluster)
                .source_version(1)
                .destination_version(1)
                .last_sync_attempt(Utc::now())
                .last_sync_success(Utc::now())
                .status(RecordStatus::Success)
                .build(),
        );
    }
    mock_delete(&fx.replica1, "kv", "team-a/removed").await;
    mock_delete(&fx.replica2, "kv", "team-a/removed").await;

    let report = fx.coordinator(&["team-a/**"]).run(false).await.unwrap();

    assert_eq!(report.jobs, 1);
    assert_eq!(
        report.status_counts.get(&ClusterSyncStatus::Deleted),
        Some(&2)
    );
    assert!(fx.ledger.rows().is_empty());
}

#[tokio::test]
async fn one_failing_job_does_not_abort_the_run() {
    let fx = Fixture::new().await;
    fx.mock_replica_mounts().await;

    mock_listing(&fx.main, "kv", &["team-a/good", "team-a/bad"]).await;
    for name in ["good", "bad"] {
        mock_secret(&fx.main, "kv", &format!("team-a/{name}"), json!({ "k": "v" }), 1).await;
    }
    for replica in [&fx.replica1, &fx.replica2] {
        mock_write(replica, "kv", "team-a/good", 1).await;
        Mock::given(method("POST"))
            .and(path("/v1/kv/data/team-a/bad"))
            .respond_with(error_response(500, "storage backend unavailable"))
            .mount(replica)
            .await;
    }

    let report = fx.coordinator(&["team-a/**"]).run(false).await.unwrap();

    assert_eq!(report.jobs, 2);
    assert_eq!(
        report.status_counts.get(&ClusterSyncStatus::Updated),
        Some(&2)
    );
    assert_eq!(
        report.status_counts.get(&ClusterSyncStatus::Failed),
        Some(&2)
    );
    assert_eq!(report.errors.len(), 1);
    let (backend, path, message) = &report.errors[0];
    assert_eq!(backend, "kv");
    assert_eq!(path, "team-a/bad");
    assert!(message.contains("failed"));
}

#[tokio::test]
async fn dry_run_reports_intent_without_touching_vault_or_ledger() {
    let fx = Fixture::new().await;
    fx.mock_replica_mounts().await;

    mock_listing(&fx.main, "kv", &["team-a/secret1"]).await;
    mock_secret(&fx.main, "kv", "team-a/secret1", json!({ "k": "v" }), 1).await;

    let report = fx.coordinator(&["team-a/**"]).run(true).await.unwrap();

    assert_eq!(report.jobs, 1);
    assert_eq!(
        report.status_counts.get(&ClusterSyncStatus::Pending),
        Some(&2)
    );
    assert!(fx.ledger.rows().is_empty());

    for server in [&fx.replica1, &fx.replica2] {
        let mutations = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| {
                (r.method == "POST" && !r.url.path().contains("/login")) || r.method == "DELETE"
            })
            .count();
        assert_eq!(mutations, 0);
    }
}
