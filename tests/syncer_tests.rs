//! Multi-cluster fan-out tests

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use vault_sync::session::ClusterSession;
use vault_sync::syncer::ClusterSyncer;
use vault_sync::types::OutcomeStatus;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

async fn syncer_with_two_replicas() -> (ClusterSyncer, MockServer, MockServer, MockServer) {
    let main = MockServer::start().await;
    let replica1 = MockServer::start().await;
    let replica2 = MockServer::start().await;
    for server in [&main, &replica1, &replica2] {
        mock_auth(server).await;
    }

    let syncer = ClusterSyncer::new(
        ClusterSession::new(&cluster_config("main", main.uri())).unwrap(),
        vec![
            // Configured out of name order on purpose: replica_names()
            // preserves insertion order, outcomes sort by name.
            ClusterSession::new(&cluster_config("replica2", replica2.uri())).unwrap(),
            ClusterSession::new(&cluster_config("replica1", replica1.uri())).unwrap(),
        ],
        4,
    );
    (syncer, main, replica1, replica2)
}

#[tokio::test]
async fn replica_names_preserve_configuration_order() {
    let (syncer, _main, _r1, _r2) = syncer_with_two_replicas().await;
    assert_eq!(
        syncer.replica_names(),
        vec!["replica2".to_string(), "replica1".to_string()]
    );
}

#[tokio::test]
async fn sync_writes_to_every_replica_in_stable_order() {
    let (syncer, main, replica1, replica2) = syncer_with_two_replicas().await;

    mock_secret(&main, "kv", "team-a/secret1", json!({ "database": "testdb" }), 1).await;
    mock_write(&replica1, "kv", "team-a/secret1", 1).await;
    mock_write(&replica2, "kv", "team-a/secret1", 5).await;

    let outcomes = syncer.sync_to_replicas("kv", "team-a/secret1").await.unwrap();

    assert_eq!(outcomes.len(), 2);
    // Sorted by cluster name regardless of configuration or completion order.
    assert_eq!(outcomes[0].cluster, "replica1");
    assert_eq!(outcomes[1].cluster, "replica2");

    for outcome in &outcomes {
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.source_version, 1);
        assert!(outcome.success_time.is_some());
        assert!(outcome.error_message.is_none());
    }
    assert_eq!(outcomes[0].destination_version, Some(1));
    assert_eq!(outcomes[1].destination_version, Some(5));
}

#[tokio::test]
async fn one_replica_failure_does_not_cancel_the_other() {
    let (syncer, main, replica1, replica2) = syncer_with_two_replicas().await;

    mock_secret(&main, "kv", "team-a/secret1", json!({ "k": "v" }), 3).await;
    mock_write(&replica1, "kv", "team-a/secret1", 3).await;
    Mock::given(method("POST"))
        .and(path("/v1/kv/data/team-a/secret1"))
        .respond_with(error_response(500, "storage backend unavailable"))
        .mount(&replica2)
        .await;

    let outcomes = syncer.sync_to_replicas("kv", "team-a/secret1").await.unwrap();

    assert_eq!(outcomes[0].cluster, "replica1");
    assert_eq!(outcomes[0].status, OutcomeStatus::Success);
    assert_eq!(outcomes[0].destination_version, Some(3));

    assert_eq!(outcomes[1].cluster, "replica2");
    assert_eq!(outcomes[1].status, OutcomeStatus::Failed);
    assert_eq!(outcomes[1].destination_version, None);
    assert!(outcomes[1].success_time.is_none());
    assert!(
        outcomes[1]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("server error"),
    );
}

#[tokio::test]
async fn source_read_failure_aborts_before_dispatch() {
    let (syncer, main, replica1, replica2) = syncer_with_two_replicas().await;

    Mock::given(method("GET"))
        .and(path("/v1/kv/data/team-a/secret1"))
        .respond_with(error_response(500, "sealed"))
        .mount(&main)
        .await;

    let err = syncer
        .sync_to_replicas("kv", "team-a/secret1")
        .await
        .unwrap_err();
    assert!(err.is_server_error());

    // No write reached either replica.
    assert!(replica1.received_requests().await.unwrap().iter().all(|r| r.method != "POST"
        || r.url.path().contains("login")));
    assert!(replica2.received_requests().await.unwrap().iter().all(|r| r.method != "POST"
        || r.url.path().contains("login")));
}

#[tokio::test]
async fn delete_fans_out_with_partial_success() {
    let (syncer, _main, replica1, replica2) = syncer_with_two_replicas().await;

    mock_delete(&replica1, "kv", "team-a/secret1").await;
    Mock::given(method("DELETE"))
        .and(path("/v1/kv/metadata/team-a/secret1"))
        .respond_with(error_response(500, "storage backend unavailable"))
        .mount(&replica2)
        .await;

    let outcomes = syncer.delete_from_replicas("kv", "team-a/secret1").await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].cluster, "replica1");
    assert_eq!(outcomes[0].status, OutcomeStatus::Success);
    assert_eq!(outcomes[1].cluster, "replica2");
    assert_eq!(outcomes[1].status, OutcomeStatus::Failed);
    assert!(outcomes[1].error_message.is_some());
}

#[tokio::test]
async fn metadata_absence_is_distinguishable_from_transport_failure() {
    let (syncer, main, _r1, _r2) = syncer_with_two_replicas().await;

    // Nothing mounted for the path: the server answers 404.
    let err = syncer.secret_metadata("kv", "gone").await.unwrap_err();
    assert!(err.is_not_found());

    Mock::given(method("GET"))
        .and(path("/v1/kv/metadata/broken"))
        .respond_with(error_response(500, "sealed"))
        .mount(&main)
        .await;
    let err = syncer.secret_metadata("kv", "broken").await.unwrap_err();
    assert!(!err.is_not_found());
    assert!(err.is_server_error());
}
