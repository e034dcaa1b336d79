//! Error types for cluster and ledger operations

use thiserror::Error;

/// Errors surfaced by a single Vault cluster call.
#[derive(Error, Debug, Clone)]
pub enum VaultError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed for role {role_id} on mount {mount}: {message}")]
    AuthFailure {
        role_id: String,
        mount: String,
        message: String,
    },

    #[error("cluster error: {message} (code: {code})")]
    ApiError { code: u16, message: String },

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("secret not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("server error: {0}")]
    ServerError(String),
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        VaultError::RequestFailed(err.to_string())
    }
}

impl VaultError {
    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound)
            || matches!(self, VaultError::ApiError { code, .. } if *code == 404)
    }

    /// Check if this is an authentication error
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, VaultError::Unauthorized)
            || matches!(self, VaultError::AuthFailure { .. })
            || matches!(self, VaultError::ApiError { code, .. } if *code == 401 || *code == 403)
    }

    /// Check if this is a server error
    pub fn is_server_error(&self) -> bool {
        matches!(self, VaultError::ServerError(_))
            || matches!(self, VaultError::ApiError { code, .. } if *code >= 500)
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors surfaced by the sync ledger.
///
/// `NotFound` is a control signal consumed during state gathering; it is
/// never shown to users.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Generic(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("record not found")]
    NotFound,
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Job-level errors for a single `(backend, path)` reconciliation.
#[derive(Error, Debug)]
pub enum JobError {
    /// Gathering ledger or source state failed; nothing was mutated.
    #[error("failed to gather state for {backend}/{path}: {source}")]
    StateGather {
        backend: String,
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// Reading the source secret before fan-out failed.
    #[error("failed to read source secret {backend}/{path}: {source}")]
    SourceRead {
        backend: String,
        path: String,
        #[source]
        source: VaultError,
    },

    /// Per-cluster failures accumulated during execution. The job itself
    /// completed; callers consume the per-cluster statuses.
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<String>),
}

fn format_aggregate(failures: &[String]) -> String {
    format!(
        "{} cluster operation(s) failed: {}",
        failures.len(),
        failures.join("; ")
    )
}

/// Fatal errors raised before any sync work starts.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Required mounts are missing on one or more clusters.
    #[error("missing mounts: {}", format_missing(.0))]
    MissingMounts(Vec<(String, Vec<String>)>),

    /// The main cluster could not be reached or authenticated against.
    #[error("main cluster unavailable: {0}")]
    MainCluster(#[source] VaultError),

    /// A replica could not be verified during the pre-flight mount check.
    #[error("replica cluster {cluster} unavailable: {source}")]
    ReplicaCluster {
        cluster: String,
        #[source]
        source: VaultError,
    },

    /// Key listing on the main cluster failed.
    #[error("failed to list keys under mount {mount}: {source}")]
    Listing {
        mount: String,
        #[source]
        source: VaultError,
    },

    /// Candidate enumeration from the ledger failed.
    #[error("failed to enumerate ledger records: {0}")]
    Ledger(#[source] LedgerError),
}

fn format_missing(missing: &[(String, Vec<String>)]) -> String {
    missing
        .iter()
        .map(|(cluster, mounts)| format!("{}: [{}]", cluster, mounts.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}
