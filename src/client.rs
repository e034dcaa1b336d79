//! HTTP client implementation for a single Vault cluster
//!
//! Thin transport layer: URL normalization, token header injection, response
//! envelope handling, and error classification. Token lifecycle lives in
//! [`crate::session`].

use crate::error::{Result, VaultError};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, Response};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Default user agent for outbound cluster requests
const DEFAULT_USER_AGENT: &str = concat!("vault-sync/", env!("CARGO_PKG_VERSION"));

/// Header carrying the cluster token.
const TOKEN_HEADER: &str = "X-Vault-Token";

/// Builder for VaultClient
#[derive(Debug, Clone)]
pub struct VaultClientBuilder {
    base_url: String,
    timeout: Duration,
    insecure: bool,
    ca_cert_pem: Option<Vec<u8>>,
    user_agent: String,
}

impl Default for VaultClientBuilder {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8200".to_string(),
            timeout: Duration::from_secs(30),
            insecure: false,
            ca_cert_pem: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl VaultClientBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cluster address
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow insecure TLS connections (self-signed certificates)
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Trust an additional PEM-encoded CA certificate
    pub fn ca_cert_pem(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert_pem = Some(pem);
        self
    }

    /// Set the user agent string for HTTP requests
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Build the client
    pub fn build(self) -> Result<VaultClient> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| VaultError::ConnectionError(format!("Invalid user agent: {}", e)))?,
        );

        let mut client_builder = Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.insecure)
            .default_headers(default_headers);

        if let Some(pem) = self.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| VaultError::ConnectionError(format!("Invalid CA cert: {}", e)))?;
            client_builder = client_builder.add_root_certificate(cert);
        }

        let client = client_builder
            .build()
            .map_err(|e| VaultError::ConnectionError(e.to_string()))?;

        Ok(VaultClient {
            base_url: self.base_url,
            timeout: self.timeout,
            client: Arc::new(client),
        })
    }
}

/// HTTP client for one Vault cluster's API
#[derive(Clone)]
pub struct VaultClient {
    base_url: String,
    timeout: Duration,
    client: Arc<Client>,
}

impl VaultClient {
    /// Create a new builder for the client
    pub fn builder() -> VaultClientBuilder {
        VaultClientBuilder::new()
    }

    /// Normalize URL path concatenation to avoid double slashes
    fn normalize_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, &url))?;

        trace!("Response status: {}", response.status());
        self.handle_response(response).await
    }

    /// Make a GET request, treating 404 as `None`
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
    ) -> Result<Option<T>> {
        match self.get(path, token).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Make a POST request
    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("POST {}", url);
        trace!("Request body keys only; values withheld");

        let response = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, token)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, &url))?;

        trace!("Response status: {}", response.status());
        self.handle_response(response).await
    }

    /// Make an unauthenticated POST request (login endpoints)
    pub async fn post_unauthenticated<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("POST {} (unauthenticated)", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, &url))?;

        trace!("Response status: {}", response.status());
        self.handle_response(response).await
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str, token: &str) -> Result<()> {
        let url = self.normalize_url(path);
        debug!("DELETE {}", url);

        let response = self
            .client
            .delete(&url)
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, &url))?;

        trace!("Response status: {}", response.status());
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }

    /// Map reqwest errors to more specific error messages
    fn map_reqwest_error(&self, error: reqwest::Error, url: &str) -> VaultError {
        if error.is_connect() {
            VaultError::ConnectionError(format!(
                "Failed to connect to {}: Connection refused or host unreachable. Check if the cluster is running and accessible.",
                url
            ))
        } else if error.is_timeout() {
            VaultError::ConnectionError(format!(
                "Request to {} timed out after {:?}. Check network connectivity or increase timeout.",
                url, self.timeout
            ))
        } else if error.is_decode() {
            VaultError::ConnectionError(format!(
                "Failed to decode JSON response from {}: {}. Server may have returned invalid JSON or an HTML error page.",
                url, error
            ))
        } else if let Some(status) = error.status() {
            VaultError::ApiError {
                code: status.as_u16(),
                message: format!("HTTP {} from {}: {}", status.as_u16(), url, error),
            }
        } else {
            VaultError::RequestFailed(error.to_string())
        }
    }

    /// Handle HTTP response
    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        if response.status().is_success() {
            let bytes = response.bytes().await.map_err(Into::<VaultError>::into)?;

            // serde_path_to_error pinpoints the offending field on shape
            // mismatches in the versioned metadata structure.
            let deserializer = &mut serde_json::Deserializer::from_slice(&bytes);
            serde_path_to_error::deserialize(deserializer).map_err(|err| {
                let path = err.path().to_string();
                VaultError::ParseError(format!(
                    "Failed to deserialize field '{}': {}",
                    path,
                    err.inner()
                ))
            })
        } else {
            Err(Self::status_error(response).await)
        }
    }

    async fn status_error(response: Response) -> VaultError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        match status.as_u16() {
            401 | 403 => VaultError::Unauthorized,
            404 => VaultError::NotFound,
            500..=599 => VaultError::ServerError(text),
            _ => VaultError::ApiError {
                code: status.as_u16(),
                message: text,
            },
        }
    }
}
