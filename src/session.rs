//! Per-cluster session: token lifecycle and KV operations
//!
//! ## Overview
//! - AppRole login with TTL-driven token refresh
//! - Mount existence checks against `sys/mounts`
//! - Recursive key listing, metadata/data reads, writes, deletes
//!
//! Every outbound operation refreshes the token first when its remaining TTL
//! is unknown or below five minutes. Concurrent callers share a single
//! in-flight login; late arrivals observe the refreshed token.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::{VaultClient, VaultClientBuilder};
use crate::config::ClusterConfig;
use crate::error::{Result, VaultError};
use crate::types::{
    AuthResponse, KeyList, SecretData, SecretMetadata, SecretReadData, SecretWriteData, TokenInfo,
    VaultResponse,
};

/// Tokens with less remaining TTL than this are refreshed before use.
const MIN_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// One authenticated session against a single cluster.
pub struct ClusterSession {
    name: String,
    client: VaultClient,
    role_id: String,
    secret_id: String,
    auth_mount: String,
    token: Mutex<Option<String>>,
}

impl ClusterSession {
    /// Build a session from cluster configuration. No network calls are made
    /// until the first operation.
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let mut builder = VaultClientBuilder::new()
            .base_url(config.address.clone())
            .insecure(config.tls_skip_verify);

        if let Some(path) = &config.tls_cert_file {
            let pem = std::fs::read(path).map_err(|e| {
                VaultError::ConnectionError(format!(
                    "failed to read TLS cert {}: {}",
                    path.display(),
                    e
                ))
            })?;
            builder = builder.ca_cert_pem(pem);
        }

        Ok(Self {
            name: config.name.clone(),
            client: builder.build()?,
            role_id: config.app_role_id.clone(),
            secret_id: config.app_role_secret.clone(),
            auth_mount: config.app_role_mount.clone(),
            token: Mutex::new(None),
        })
    }

    /// Logical cluster name, as it appears in ledger rows and outcomes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return a token with at least [`MIN_TOKEN_TTL`] remaining, re-logging
    /// in when required. The lock is held across the login so only one
    /// re-login is ever in flight.
    async fn ensure_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;

        if let Some(token) = guard.as_ref() {
            match self
                .client
                .get::<VaultResponse<TokenInfo>>("/v1/auth/token/lookup-self", token)
                .await
            {
                Ok(info) if info.data.ttl >= MIN_TOKEN_TTL.as_secs() as i64 => {
                    return Ok(token.clone());
                }
                Ok(info) => {
                    debug!(cluster = %self.name, ttl = info.data.ttl, "token near expiry, re-login");
                }
                Err(e) => {
                    debug!(cluster = %self.name, error = %e, "token TTL lookup failed, re-login");
                }
            }
        }

        let token = self.login().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Role-based login against the configured auth mount. The secret id
    /// never appears in errors or logs.
    async fn login(&self) -> Result<String> {
        let path = format!("/v1/auth/{}/login", self.auth_mount);
        let body = json!({
            "role_id": self.role_id,
            "secret_id": self.secret_id,
        });

        let response: AuthResponse = self
            .client
            .post_unauthenticated(&path, &body)
            .await
            .map_err(|e| VaultError::AuthFailure {
                role_id: self.role_id.clone(),
                mount: self.auth_mount.clone(),
                message: e.to_string(),
            })?;

        info!(
            cluster = %self.name,
            lease_duration = response.auth.lease_duration,
            "logged in"
        );
        Ok(response.auth.client_token)
    }

    /// Return the expected mounts that are not configured on this cluster.
    /// Mount paths are compared without a trailing `/`.
    pub async fn check_mounts(&self, expected: &[String]) -> Result<Vec<String>> {
        let token = self.ensure_token().await?;
        let response: Value = self.client.get("/v1/sys/mounts", &token).await?;

        // Newer servers wrap the mount table in the response envelope.
        let table = response.get("data").unwrap_or(&response);
        let mounted: Vec<&str> = table
            .as_object()
            .map(|m| m.keys().map(|k| k.trim_end_matches('/')).collect())
            .unwrap_or_default();

        Ok(expected
            .iter()
            .filter(|mount| !mounted.contains(&mount.trim_end_matches('/')))
            .cloned()
            .collect())
    }

    /// Recursively enumerate every leaf path under `mount`. Returned paths
    /// are mount-relative. A missing tree is empty, not an error.
    pub async fn list_keys(&self, mount: &str) -> Result<Vec<String>> {
        let token = self.ensure_token().await?;
        let mut pending = vec![String::new()];
        let mut leaves = Vec::new();

        while let Some(prefix) = pending.pop() {
            let path = format!("/v1/{}/metadata/{}?list=true", mount, prefix);
            let listing: Option<VaultResponse<KeyList>> =
                self.client.get_optional(&path, &token).await?;

            let Some(listing) = listing else { continue };
            for key in listing.data.keys {
                match key.strip_suffix('/') {
                    // Trailing slash marks an intermediate node; recurse.
                    Some(dir) => pending.push(format!("{}{}/", prefix, dir)),
                    None => leaves.push(format!("{}{}", prefix, key)),
                }
            }
        }

        leaves.sort();
        Ok(leaves)
    }

    /// Read the versioned metadata for a secret path.
    pub async fn read_metadata(&self, mount: &str, path: &str) -> Result<SecretMetadata> {
        let token = self.ensure_token().await?;
        let url = format!("/v1/{}/metadata/{}", mount, path);
        let response: VaultResponse<SecretMetadata> = self.client.get(&url, &token).await?;
        Ok(response.data)
    }

    /// Read the latest version of a secret. `None` when the path is absent
    /// or its current version is not readable.
    pub async fn read_latest(&self, mount: &str, path: &str) -> Result<Option<(SecretData, i64)>> {
        let token = self.ensure_token().await?;
        let url = format!("/v1/{}/data/{}", mount, path);
        let response: Option<VaultResponse<SecretReadData>> =
            self.client.get_optional(&url, &token).await?;
        Ok(response.map(|r| (r.data.data, r.data.metadata.version)))
    }

    /// Write a secret, returning the version assigned by the cluster.
    pub async fn write(&self, mount: &str, path: &str, data: &SecretData) -> Result<i64> {
        let token = self.ensure_token().await?;
        let url = format!("/v1/{}/data/{}", mount, path);
        let body = json!({ "data": data });
        let response: VaultResponse<SecretWriteData> =
            self.client.post(&url, &token, &body).await?;
        Ok(response.data.version)
    }

    /// Remove a secret and all version markers so subsequent reads observe
    /// absence.
    pub async fn delete(&self, mount: &str, path: &str) -> Result<()> {
        let token = self.ensure_token().await?;
        let url = format!("/v1/{}/metadata/{}", mount, path);
        self.client.delete(&url, &token).await
    }

    /// Observe the secret for replication purposes: `Some(current_version)`
    /// when the metadata exists and the current version is readable, `None`
    /// otherwise.
    ///
    /// A destroyed current version is treated as absent, and a soft-deleted
    /// one likewise but logged as its own event.
    pub async fn observe_secret(&self, mount: &str, path: &str) -> Result<Option<i64>> {
        let metadata = match self.read_metadata(mount, path).await {
            Ok(metadata) => metadata,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(current) = metadata.current() else {
            return Err(VaultError::ParseError(format!(
                "metadata for {}/{} has no descriptor for current version {}",
                mount, path, metadata.current_version
            )));
        };

        if current.destroyed {
            debug!(cluster = %self.name, mount, path, "current version destroyed, treating as absent");
            return Ok(None);
        }
        if current.deletion_time.is_some() {
            info!(cluster = %self.name, mount, path, "current version soft-deleted, treating as absent");
            return Ok(None);
        }
        Ok(Some(metadata.current_version))
    }

    /// Whether the secret is present: its current version is readable.
    pub async fn secret_exists(&self, mount: &str, path: &str) -> Result<bool> {
        Ok(self.observe_secret(mount, path).await?.is_some())
    }

    /// Read-only view used by `sync_to_replicas`: latest data plus metadata
    /// version, failing when the source is unexpectedly absent.
    pub async fn read_current(&self, mount: &str, path: &str) -> Result<(SecretData, i64)> {
        self.read_latest(mount, path)
            .await?
            .ok_or(VaultError::NotFound)
    }
}

