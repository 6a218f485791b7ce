//! Token verification for services that do not hold the private key.
//!
//! [`RemoteVerifier`] pulls public keys through a [`RemoteKeyCache`] and asks
//! the issuer about revocation on every request through a
//! [`RevocationChecker`]. The two network dependencies fail differently:
//!
//! - keys: once any key was fetched, failures degrade to the stale set. Before
//!   the first successful fetch, [`FailMode`] decides (closed rejects, open
//!   lets requests through unauthenticated).
//! - revocation: always fail-closed.

pub mod key_cache;
pub mod revocation;
pub mod source;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use key_cache::{KeyMap, RemoteKeyCache, VerificationKey, spawn_refresh_task};
pub use revocation::RevocationChecker;
pub use source::{FetchError, HttpKeySource, KeySource};

use crate::clock::Clock;
use crate::config::{FailMode, RemoteConfig};
use crate::failsafe::RetryPolicy;
use crate::server::auth::{TokenVerifier, VerifyOutcome};
use crate::token::{Claims, TokenError, TokenType, verify};
use crate::{Error, Result};

/// Verifies tokens with keys fetched from (or configured for) a remote issuer.
pub struct RemoteVerifier {
    cache: Arc<RemoteKeyCache>,
    revocation: Option<RevocationChecker>,
    fail_mode: FailMode,
    issuer: Option<String>,
    clock: Arc<dyn Clock>,
    refresh_interval: Option<Duration>,
}

impl RemoteVerifier {
    /// Assemble a verifier from parts.
    pub fn new(
        cache: Arc<RemoteKeyCache>,
        revocation: Option<RevocationChecker>,
        fail_mode: FailMode,
        issuer: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            revocation,
            fail_mode,
            issuer,
            clock,
            refresh_interval: None,
        }
    }

    /// Refresh the key set in the background every `interval`, independent of
    /// request traffic. Takes effect through [`Self::spawn_background`].
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Start the proactive key refresh task.
    ///
    /// Returns `None` for a static key or when no (non-zero) refresh interval
    /// is set.
    /// The task stops when `shutdown` fires.
    pub fn spawn_background(&self, shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        let interval = self.refresh_interval.filter(|i| !i.is_zero())?;
        if !self.cache.is_remote() {
            return None;
        }
        info!(interval_secs = interval.as_secs(), "Starting background key refresh");
        Some(spawn_refresh_task(Arc::clone(&self.cache), interval, shutdown))
    }

    /// Build from configuration.
    ///
    /// A static public key disables key fetching. The revocation check needs
    /// `issuer_url` regardless of how keys are obtained.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when neither an issuer URL nor a static key is
    /// configured, or the revocation check is enabled without an issuer URL.
    pub fn from_config(config: &RemoteConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let cache = match (&config.static_public_key_pem, &config.static_key_id, &config.issuer_url) {
            (Some(pem), Some(kid), _) => {
                let key = VerificationKey::from_pem(kid, config.algorithm, pem)?;
                RemoteKeyCache::with_static_key(key, Arc::clone(&clock))
            }
            (_, _, Some(url)) => RemoteKeyCache::new(
                Arc::new(HttpKeySource::with_client(url, client.clone())),
                config.cache_ttl,
                RetryPolicy::new(&config.retry),
                Arc::clone(&clock),
            ),
            _ => {
                return Err(Error::Config(
                    "remote verification needs remote.issuer_url or a static public key".to_string(),
                ));
            }
        };

        let revocation = match (config.revocation_check, &config.issuer_url) {
            (false, _) => None,
            (true, Some(url)) => Some(RevocationChecker::with_client(url, client)),
            (true, None) => {
                return Err(Error::Config(
                    "remote.revocation_check requires remote.issuer_url".to_string(),
                ));
            }
        };

        Ok(Self::new(
            Arc::new(cache),
            revocation,
            config.fail_mode,
            config.issuer.clone(),
            clock,
        )
        .with_refresh_interval(config.refresh_interval))
    }

    /// The underlying key cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<RemoteKeyCache> {
        &self.cache
    }

    /// Verify `token`: key lookup by `kid`, signature, expiry, then revocation.
    pub async fn validate_token(&self, token: &str) -> std::result::Result<VerifyOutcome, TokenError> {
        let kid = verify::header_kid(token)?;

        let key = match self.cache.get_verification_key(&kid).await {
            Ok(key) => key,
            Err(TokenError::KeyFetchFailure) if self.fail_mode == FailMode::Open => {
                error!("No verification key available, fail-open: request proceeds unauthenticated");
                return Ok(VerifyOutcome::Bypass);
            }
            Err(e) => return Err(e),
        };

        let claims: Claims =
            verify::decode_claims(token, &kid, key.algorithm, &key.decoding, self.issuer.as_deref())?;
        verify::check_expiry(&claims, self.clock.now())?;

        if let Some(checker) = &self.revocation {
            if checker.is_token_revoked(token).await {
                return Err(TokenError::TokenRevoked);
            }
        }

        Ok(VerifyOutcome::Verified(claims))
    }
}

#[async_trait::async_trait]
impl TokenVerifier for RemoteVerifier {
    async fn verify(&self, token: &str) -> std::result::Result<VerifyOutcome, TokenError> {
        match self.validate_token(token).await? {
            VerifyOutcome::Verified(claims) if claims.typ != TokenType::Access => {
                Err(TokenError::WrongTokenType)
            }
            outcome => Ok(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn from_config_requires_a_key_source() {
        let config = RemoteConfig {
            revocation_check: false,
            ..RemoteConfig::default()
        };

        let result = RemoteVerifier::from_config(&config, Arc::new(ManualClock::starting_now()));

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn revocation_check_requires_issuer_url() {
        let pair = crate::keys::KeyAlgorithm::Es256.generate().unwrap();
        let config = RemoteConfig {
            static_public_key_pem: Some(pair.public_key_pem),
            static_key_id: Some(pair.kid),
            revocation_check: true,
            ..RemoteConfig::default()
        };

        let result = RemoteVerifier::from_config(&config, Arc::new(ManualClock::starting_now()));

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn static_key_config_builds_non_fetching_cache() {
        let pair = crate::keys::KeyAlgorithm::Es256.generate().unwrap();
        let config = RemoteConfig {
            static_public_key_pem: Some(pair.public_key_pem),
            static_key_id: Some(pair.kid),
            revocation_check: false,
            ..RemoteConfig::default()
        };

        let verifier =
            RemoteVerifier::from_config(&config, Arc::new(ManualClock::starting_now())).unwrap();

        assert!(!verifier.cache().is_remote());
        let (_tx, rx) = broadcast::channel(1);
        assert!(verifier.spawn_background(rx).is_none());
    }
}
