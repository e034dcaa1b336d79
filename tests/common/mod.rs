//! Common test utilities: canned cluster responses and an in-memory ledger
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vault_sync::config::ClusterConfig;
use vault_sync::error::{LedgerError, LedgerResult};
use vault_sync::ledger::LedgerStore;
use vault_sync::types::SyncedSecret;

pub const TEST_TOKEN: &str = "test-token";

/// Create a standard success response
pub fn success_response(body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

/// Create a cluster-style error response
pub fn error_response(code: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({ "errors": [message] }))
}

/// Mount login and token-lookup endpoints so a session can authenticate.
pub async fn mock_auth(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .respond_with(success_response(json!({
            "auth": { "client_token": TEST_TOKEN, "lease_duration": 3600 }
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/auth/token/lookup-self"))
        .respond_with(success_response(json!({ "data": { "ttl": 3600 } })))
        .mount(server)
        .await;
}

/// Cluster configuration pointing at a mock server.
pub fn cluster_config(name: &str, address: String) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        address,
        app_role_id: "test-role".to_string(),
        app_role_secret: "test-secret".to_string(),
        app_role_mount: "approle".to_string(),
        tls_skip_verify: false,
        tls_cert_file: None,
    }
}

/// Versioned metadata body with a single readable current version.
pub fn metadata_body(current_version: i64) -> serde_json::Value {
    let mut versions = serde_json::Map::new();
    versions.insert(
        current_version.to_string(),
        json!({
            "created_time": "2024-01-01T00:00:00Z",
            "deletion_time": "",
            "destroyed": false
        }),
    );
    json!({ "data": { "current_version": current_version, "versions": versions } })
}

/// Secret read body carrying the payload and its version.
pub fn secret_body(data: serde_json::Value, version: i64) -> serde_json::Value {
    json!({ "data": { "data": data, "metadata": { "version": version } } })
}

/// Write response body with the assigned version.
pub fn write_body(version: i64) -> serde_json::Value {
    json!({ "data": { "version": version } })
}

/// Key listing body.
pub fn keys_body(keys: &[&str]) -> serde_json::Value {
    json!({ "data": { "keys": keys } })
}

/// `sys/mounts` body for the given secret engines.
pub fn mounts_body(mounts: &[&str]) -> serde_json::Value {
    let table: serde_json::Map<String, serde_json::Value> = mounts
        .iter()
        .map(|m| (format!("{m}/"), json!({ "type": "kv", "options": { "version": "2" } })))
        .collect();
    json!({ "data": table })
}

/// Mount a readable secret (metadata + data endpoints) on a mock cluster.
pub async fn mock_secret(
    server: &MockServer,
    mount: &str,
    secret_path: &str,
    data: serde_json::Value,
    version: i64,
) {
    Mock::given(method("GET"))
        .and(path(format!("/v1/{mount}/metadata/{secret_path}")))
        .respond_with(success_response(metadata_body(version)))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v1/{mount}/data/{secret_path}")))
        .respond_with(success_response(secret_body(data, version)))
        .mount(server)
        .await;
}

/// Accept writes for a path, responding with the given version.
pub async fn mock_write(server: &MockServer, mount: &str, secret_path: &str, version: i64) {
    Mock::given(method("POST"))
        .and(path(format!("/v1/{mount}/data/{secret_path}")))
        .respond_with(success_response(write_body(version)))
        .mount(server)
        .await;
}

/// Accept metadata deletion for a path.
pub async fn mock_delete(server: &MockServer, mount: &str, secret_path: &str) {
    Mock::given(method("DELETE"))
        .and(path(format!("/v1/{mount}/metadata/{secret_path}")))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

/// Mount `sys/mounts` and a key listing for one mount.
pub async fn mock_listing(server: &MockServer, mount: &str, keys: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/v1/sys/mounts"))
        .respond_with(success_response(mounts_body(&[mount])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v1/{mount}/metadata/")))
        .and(query_param("list", "true"))
        .respond_with(success_response(keys_body(keys)))
        .mount(server)
        .await;
}

/// In-memory [`LedgerStore`] for job and coordinator tests.
#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<BTreeMap<(String, String, String), SyncedSecret>>,
    pub fail_gets: AtomicBool,
    pub fail_upserts: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: SyncedSecret) {
        let key = (
            row.secret_backend.clone(),
            row.secret_path.clone(),
            row.destination_cluster.clone(),
        );
        self.rows.lock().unwrap().insert(key, row);
    }

    /// All rows sorted by `(backend, path, cluster)`.
    pub fn rows(&self) -> Vec<SyncedSecret> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    pub fn row(&self, backend: &str, path: &str, cluster: &str) -> Option<SyncedSecret> {
        self.rows
            .lock()
            .unwrap()
            .get(&(backend.to_string(), path.to_string(), cluster.to_string()))
            .cloned()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get(&self, backend: &str, path: &str, cluster: &str) -> LedgerResult<SyncedSecret> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("circuit breaker open".to_string()));
        }
        self.row(backend, path, cluster).ok_or(LedgerError::NotFound)
    }

    async fn list(&self) -> LedgerResult<Vec<SyncedSecret>> {
        Ok(self.rows())
    }

    async fn upsert(&self, row: &SyncedSecret) -> LedgerResult<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(LedgerError::Generic("upsert failed".to_string()));
        }
        self.insert(row.clone());
        Ok(())
    }

    async fn delete(&self, backend: &str, path: &str, cluster: &str) -> LedgerResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(LedgerError::Generic("delete failed".to_string()));
        }
        self.rows.lock().unwrap().remove(&(
            backend.to_string(),
            path.to_string(),
            cluster.to_string(),
        ));
        Ok(())
    }

    async fn close(&self) {}
}
