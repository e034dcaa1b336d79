//! Wire and domain models shared across the crate
//!
//! Wire types mirror the KV v2 response envelope; domain types carry the
//! per-cluster outcomes and the durable ledger row.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use typed_builder::TypedBuilder;

/// Sentinel written into both version columns when a replica deletion fails,
/// so failed-deletion rows are unambiguous in the schema.
pub const DELETION_FAILURE_VERSION: i64 = -1000;

/// Opaque secret payload: string keys to string values.
pub type SecretData = BTreeMap<String, String>;

/// Response envelope wrapping every KV v2 payload.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultResponse<T> {
    pub data: T,
}

/// Auth section of a login response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub auth: AuthInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthInfo {
    pub client_token: String,
    /// Token validity in seconds.
    pub lease_duration: u64,

    #[serde(flatten)]
    pub extra: Value,
}

/// `auth/token/lookup-self` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    /// Remaining TTL in seconds.
    pub ttl: i64,

    #[serde(flatten)]
    pub extra: Value,
}

/// Key listing payload. Entries with a trailing `/` are intermediate nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyList {
    pub keys: Vec<String>,
}

/// Versioned metadata for a secret path.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretMetadata {
    pub current_version: i64,
    /// Per-version descriptors keyed by stringified version number.
    pub versions: BTreeMap<String, SecretVersion>,

    #[serde(flatten)]
    pub extra: Value,
}

impl SecretMetadata {
    /// Descriptor of the current version, when the server reported one.
    pub fn current(&self) -> Option<&SecretVersion> {
        self.versions.get(&self.current_version.to_string())
    }
}

/// Descriptor for a single secret version.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretVersion {
    pub created_time: DateTime<Utc>,
    /// Set when the version was soft-deleted. The server sends an empty
    /// string for live versions.
    #[serde(deserialize_with = "empty_string_as_none", default)]
    pub deletion_time: Option<DateTime<Utc>>,
    pub destroyed: bool,

    #[serde(flatten)]
    pub extra: Value,
}

impl SecretVersion {
    /// Whether this version can be read back: neither destroyed nor
    /// soft-deleted.
    pub fn is_readable(&self) -> bool {
        !self.destroyed && self.deletion_time.is_none()
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom),
    }
}

/// `data/{path}` read payload: the secret plus its version metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretReadData {
    pub data: SecretData,
    pub metadata: SecretReadMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretReadMetadata {
    pub version: i64,

    #[serde(flatten)]
    pub extra: Value,
}

/// `data/{path}` write payload: the version assigned by the cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretWriteData {
    pub version: i64,

    #[serde(flatten)]
    pub extra: Value,
}

/// Result of a single replica operation within a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failed,
}

/// Per-replica result of a secret write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub cluster: String,
    pub status: OutcomeStatus,
    pub source_version: i64,
    pub destination_version: Option<i64>,
    pub error_message: Option<String>,
    pub attempt_time: DateTime<Utc>,
    pub success_time: Option<DateTime<Utc>>,
}

/// Per-replica result of a secret deletion.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub cluster: String,
    pub status: OutcomeStatus,
    pub error_message: Option<String>,
    pub attempt_time: DateTime<Utc>,
}

/// Final per-cluster status reported by a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterSyncStatus {
    Updated,
    Deleted,
    ErrorDeleting,
    Unmodified,
    Failed,
    Unknown,
    Pending,
}

impl fmt::Display for ClusterSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterSyncStatus::Updated => "updated",
            ClusterSyncStatus::Deleted => "deleted",
            ClusterSyncStatus::ErrorDeleting => "error_deleting",
            ClusterSyncStatus::Unmodified => "unmodified",
            ClusterSyncStatus::Failed => "failed",
            ClusterSyncStatus::Unknown => "unknown",
            ClusterSyncStatus::Pending => "pending",
        };
        f.write_str(s)
    }
}

/// Persisted status of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Success,
    Failed,
    Pending,
    Deleted,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
            RecordStatus::Pending => "pending",
            RecordStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RecordStatus::Success),
            "failed" => Ok(RecordStatus::Failed),
            "pending" => Ok(RecordStatus::Pending),
            "deleted" => Ok(RecordStatus::Deleted),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// Durable record of what has been propagated where, keyed by
/// `(secret_backend, secret_path, destination_cluster)`.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct SyncedSecret {
    #[builder(setter(into))]
    pub secret_backend: String,
    #[builder(setter(into))]
    pub secret_path: String,
    #[builder(setter(into))]
    pub destination_cluster: String,
    pub source_version: i64,
    #[builder(default, setter(strip_option))]
    pub destination_version: Option<i64>,
    pub last_sync_attempt: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub last_sync_success: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SyncedSecret {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let status_text: String = row.try_get("status")?;
        let status = RecordStatus::from_str(&status_text).map_err(|e| {
            sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: e.into(),
            }
        })?;

        Ok(SyncedSecret {
            secret_backend: row.try_get("secret_backend")?,
            secret_path: row.try_get("secret_path")?,
            destination_cluster: row.try_get("destination_cluster")?,
            source_version: row.try_get("source_version")?,
            destination_version: row.try_get("destination_version")?,
            last_sync_attempt: row.try_get("last_sync_attempt")?,
            last_sync_success: row.try_get("last_sync_success")?,
            status,
            error_message: row.try_get("error_message")?,
        })
    }
}
