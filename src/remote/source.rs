//! Where remote verifiers get public keys from.

use std::time::Duration;

use thiserror::Error;

use crate::failsafe::Transient;
use crate::keys::{KeySet, PublishedKey};

/// Key fetch errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// Connection failure or timeout
    #[error("transport error: {0}")]
    Transport(String),

    /// Issuer answered with a non-success status
    #[error("unexpected status {0}")]
    Status(u16),

    /// Issuer answered with something that is not a usable key set
    #[error("invalid key set: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(code) => *code >= 500 || *code == 429,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// A provider of the issuer's current public keys.
#[async_trait::async_trait]
pub trait KeySource: Send + Sync + 'static {
    /// Cheap liveness probe run before each fetch attempt.
    async fn health(&self) -> Result<(), FetchError>;

    /// The issuer's active and retiring public keys.
    async fn fetch_keys(&self) -> Result<Vec<PublishedKey>, FetchError>;
}

/// Key source backed by the issuer's HTTP endpoints
/// (`GET /health`, `GET /auth/keys`).
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpKeySource {
    /// Create a source for the issuer at `base_url`. Every request is bounded
    /// by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    /// Create a source sharing an existing client.
    #[must_use]
    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Issuer base URL without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl KeySource for HttpKeySource {
    async fn health(&self) -> Result<(), FetchError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn fetch_keys(&self) -> Result<Vec<PublishedKey>, FetchError> {
        let response = self
            .client
            .get(format!("{}/auth/keys", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        let set: KeySet = response.json().await?;
        Ok(set.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        assert!(FetchError::Status(503).is_transient());
        assert!(FetchError::Status(429).is_transient());
        assert!(!FetchError::Status(404).is_transient());
        assert!(FetchError::Transport("reset".into()).is_transient());
        assert!(!FetchError::InvalidResponse("bad".into()).is_transient());
    }

    #[test]
    fn base_url_is_normalized() {
        let source = HttpKeySource::new("http://auth:39480/", Duration::from_secs(5)).unwrap();

        assert_eq!(source.base_url(), "http://auth:39480");
    }

    #[tokio::test]
    async fn unreachable_issuer_is_transport_error() {
        // Port 1 on loopback refuses connections
        let source = HttpKeySource::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();

        let result = source.health().await;

        assert!(matches!(result, Err(FetchError::Transport(_))));
    }
}
