//! Configuration loading
//!
//! Configuration is a YAML document. `${NAME}` references inside string
//! values are expanded from the process environment at load time, so
//! credentials can stay out of the file itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment variable {0} referenced in config is not set")]
    MissingEnvVar(String),

    #[error("unknown ssl_mode: {0}")]
    InvalidSslMode(String),

    #[error("unknown config section: {0}")]
    UnknownSection(String),
}

/// Effective configuration for one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Instance identifier, included in log output.
    pub id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Worker pool size; also bounds the per-job replica fan-out.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub sync_rule: SyncRule,
    pub postgres: PostgresConfig,
    pub vault: VaultTopology,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_concurrency() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRule {
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
    pub kv_mounts: Vec<String>,
    pub paths_to_replicate: Vec<String>,
    #[serde(default)]
    pub paths_to_ignore: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub db_name: String,
    pub ssl_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

impl PostgresConfig {
    /// Connection options for the sync ledger pool.
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        let ssl_mode = match self.ssl_mode.as_str() {
            "disable" => PgSslMode::Disable,
            "allow" => PgSslMode::Allow,
            "prefer" => PgSslMode::Prefer,
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            other => return Err(ConfigError::InvalidSslMode(other.to_string())),
        };

        Ok(PgConnectOptions::new()
            .host(&self.address)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.db_name)
            .ssl_mode(ssl_mode))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultTopology {
    pub main_cluster: ClusterConfig,
    pub replica_clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Logical cluster name used in the ledger and in outcomes.
    pub name: String,
    pub address: String,
    pub app_role_id: String,
    pub app_role_secret: String,
    /// Auth mount the AppRole login is performed against.
    pub app_role_mount: String,
    #[serde(default)]
    pub tls_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_file: Option<PathBuf>,
}

impl Config {
    /// Load and env-expand a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse a YAML document, expanding `${NAME}` in string values.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        expand_env(&mut value)?;
        Ok(serde_yaml::from_value(value)?)
    }

    /// Copy with secret material replaced by `***`, for printing.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        out.postgres.password = "***".to_string();
        out.vault.main_cluster.app_role_secret = "***".to_string();
        for replica in &mut out.vault.replica_clusters {
            replica.app_role_secret = "***".to_string();
        }
        out
    }

    /// Render the redacted configuration as YAML, optionally a single
    /// top-level section.
    pub fn render(&self, section: Option<&str>) -> Result<String, ConfigError> {
        let value = serde_yaml::to_value(self.redacted())?;
        let value = match section {
            None => value,
            Some(name) => value
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownSection(name.to_string()))?,
        };
        Ok(serde_yaml::to_string(&value)?)
    }
}

/// Expand `${NAME}` references in every string of a YAML value tree.
fn expand_env(value: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = expand_str(s)?;
            Ok(())
        }
        serde_yaml::Value::Sequence(seq) => seq.iter_mut().try_for_each(expand_env),
        serde_yaml::Value::Mapping(map) => map.values_mut().try_for_each(expand_env),
        _ => Ok(()),
    }
}

fn expand_str(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                let value = std::env::var(name)
                    .map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
                out.push_str(&value);
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference; keep the literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
