//! Cached copy of the issuer's public keys.
//!
//! Reads are served from an in-memory snapshot while it is younger than the
//! TTL. A stale or empty cache is refreshed under an async mutex with a second
//! freshness check after the lock is taken, so any number of concurrent misses
//! cost one fetch. When every retry fails the last good snapshot keeps being
//! served (degraded mode) until a fetch succeeds again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::source::{FetchError, KeySource};
use crate::clock::{Clock, delta};
use crate::failsafe::{RetryPolicy, with_retry};
use crate::keys::{KeyAlgorithm, KeyError};
use crate::token::TokenError;

/// Minimum age of the snapshot before an unknown `kid` may force a refetch.
const UNKNOWN_KID_REFETCH_FLOOR: Duration = Duration::from_secs(10);

/// After a failed refresh falls back to stale keys, requests are served the
/// stale set without fetching for this long. The background ticker keeps
/// retrying regardless.
pub const DEGRADED_RETRY_AFTER: Duration = Duration::from_secs(30);

/// A parsed public key.
#[derive(Clone)]
pub struct VerificationKey {
    /// Key id
    pub kid: String,
    /// Algorithm
    pub algorithm: KeyAlgorithm,
    /// Parsed key
    pub decoding: DecodingKey,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Parse a PEM public key.
    pub fn from_pem(kid: &str, algorithm: KeyAlgorithm, pem: &str) -> Result<Self, KeyError> {
        Ok(Self {
            kid: kid.to_string(),
            algorithm,
            decoding: algorithm.decoding_key(pem)?,
        })
    }
}

/// Keys by `kid`.
pub type KeyMap = HashMap<String, VerificationKey>;

struct Snapshot {
    keys: Arc<KeyMap>,
    fetched_at: DateTime<Utc>,
}

/// Public key cache for services that verify but do not issue tokens.
pub struct RemoteKeyCache {
    source: Option<Arc<dyn KeySource>>,
    snapshot: RwLock<Option<Snapshot>>,
    retry_after: RwLock<Option<DateTime<Utc>>>,
    refresh_lock: tokio::sync::Mutex<()>,
    ttl: TimeDelta,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    attempts: AtomicU64,
    fetches: AtomicU64,
    degraded: AtomicU64,
}

impl RemoteKeyCache {
    /// Cache keys fetched from `source`, fresh for `ttl`.
    pub fn new(
        source: Arc<dyn KeySource>,
        ttl: Duration,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source: Some(source),
            snapshot: RwLock::new(None),
            retry_after: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            ttl: delta(ttl),
            retry,
            clock,
            attempts: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    /// A cache holding one statically configured key. Never fetches.
    pub fn with_static_key(key: VerificationKey, clock: Arc<dyn Clock>) -> Self {
        let mut keys = KeyMap::new();
        keys.insert(key.kid.clone(), key);
        let now = clock.now();
        Self {
            source: None,
            snapshot: RwLock::new(Some(Snapshot {
                keys: Arc::new(keys),
                fetched_at: now,
            })),
            retry_after: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            ttl: TimeDelta::MAX,
            retry: RetryPolicy {
                enabled: false,
                max_attempts: 1,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
                multiplier: 1.0,
            },
            clock,
            attempts: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    /// Current verification keys.
    ///
    /// # Errors
    ///
    /// [`TokenError::KeyFetchFailure`] if no key has ever been obtained.
    pub async fn get_verification_keys(&self) -> Result<Arc<KeyMap>, TokenError> {
        if let Some(keys) = self.fresh() {
            return Ok(keys);
        }
        self.refresh_single_flight(|cache| cache.fresh().is_some()).await
    }

    /// The key for `kid`, refetching once if the cached set lacks it.
    ///
    /// # Errors
    ///
    /// [`TokenError::KeyFetchFailure`] if no key has ever been obtained,
    /// [`TokenError::UnknownSigningKey`] if the issuer does not publish `kid`.
    pub async fn get_verification_key(&self, kid: &str) -> Result<VerificationKey, TokenError> {
        let keys = self.get_verification_keys().await?;
        if let Some(key) = keys.get(kid) {
            return Ok(key.clone());
        }
        self.refresh_for_unknown_kid(kid)
            .await?
            .get(kid)
            .cloned()
            .ok_or(TokenError::UnknownSigningKey)
    }

    /// Refetch because a token named a `kid` the snapshot does not have.
    ///
    /// Skipped while the snapshot is younger than a short floor so forged
    /// `kid`s cannot drive a fetch per request.
    pub async fn refresh_for_unknown_kid(&self, kid: &str) -> Result<Arc<KeyMap>, TokenError> {
        let floor = |cache: &Self| {
            cache
                .snapshot
                .read()
                .as_ref()
                .is_some_and(|s| cache.clock.now() - s.fetched_at < delta(UNKNOWN_KID_REFETCH_FLOOR))
                || cache.held_off()
        };
        if floor(self) || self.source.is_none() {
            return self.current().ok_or(TokenError::KeyFetchFailure);
        }
        debug!(kid = %kid, "Key id not in cached set, refreshing");
        self.refresh_single_flight(|cache| floor(cache)).await
    }

    /// Unconditional refresh (background ticker).
    pub async fn refresh(&self) -> Result<Arc<KeyMap>, TokenError> {
        self.refresh_single_flight(|_| false).await
    }

    /// Take the refresh lock, skip the fetch if `satisfied` now holds or
    /// another task attempted a fetch while we waited, otherwise fetch.
    async fn refresh_single_flight(
        &self,
        satisfied: impl Fn(&Self) -> bool,
    ) -> Result<Arc<KeyMap>, TokenError> {
        let Some(source) = self.source.as_ref() else {
            return self.current().ok_or(TokenError::KeyFetchFailure);
        };

        let seen = self.attempts.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if satisfied(self) || self.attempts.load(Ordering::Acquire) != seen {
            return self.current().ok_or(TokenError::KeyFetchFailure);
        }

        self.attempts.fetch_add(1, Ordering::AcqRel);
        match self.fetch(source.as_ref()).await {
            Ok(keys) => {
                let keys = Arc::new(keys);
                *self.snapshot.write() = Some(Snapshot {
                    keys: Arc::clone(&keys),
                    fetched_at: self.clock.now(),
                });
                *self.retry_after.write() = None;
                info!(count = keys.len(), "Refreshed verification keys");
                Ok(keys)
            }
            Err(e) => match self.current() {
                Some(stale) => {
                    self.degraded.fetch_add(1, Ordering::Relaxed);
                    *self.retry_after.write() =
                        Some(self.clock.now() + delta(DEGRADED_RETRY_AFTER));
                    warn!(
                        error = %e,
                        retry_after_secs = DEGRADED_RETRY_AFTER.as_secs(),
                        "Key refresh failed, serving stale verification keys (degraded)"
                    );
                    Ok(stale)
                }
                None => {
                    error!(error = %e, "Key fetch failed and no verification key has ever been obtained");
                    Err(TokenError::KeyFetchFailure)
                }
            },
        }
    }

    async fn fetch(&self, source: &dyn KeySource) -> Result<KeyMap, FetchError> {
        let published = with_retry(&self.retry, "fetch_verification_keys", || async {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            source.health().await?;
            source.fetch_keys().await
        })
        .await?;

        let mut keys = KeyMap::new();
        for entry in published {
            match VerificationKey::from_pem(&entry.kid, entry.alg, &entry.public_key_pem) {
                Ok(key) => {
                    keys.insert(entry.kid, key);
                }
                Err(e) => warn!(kid = %entry.kid, error = %e, "Ignoring unusable published key"),
            }
        }
        if keys.is_empty() {
            return Err(FetchError::InvalidResponse("no usable keys".to_string()));
        }
        Ok(keys)
    }

    fn fresh(&self) -> Option<Arc<KeyMap>> {
        let now = self.clock.now();
        let held_off = self.held_off();
        self.snapshot
            .read()
            .as_ref()
            .filter(|s| self.source.is_none() || held_off || now - s.fetched_at < self.ttl)
            .map(|s| Arc::clone(&s.keys))
    }

    /// Whether a recent failed refresh put request-driven fetches on hold.
    fn held_off(&self) -> bool {
        self.retry_after
            .read()
            .is_some_and(|until| self.clock.now() < until)
    }

    fn current(&self) -> Option<Arc<KeyMap>> {
        self.snapshot.read().as_ref().map(|s| Arc::clone(&s.keys))
    }

    /// Whether at least one key has been obtained.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// Number of fetch attempts made against the source (each retry counts).
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of times a stale snapshot was served after a failed refresh.
    #[must_use]
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Whether this cache fetches at all (false for a static key).
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.source.is_some()
    }
}

/// Spawn a task that refreshes `cache` every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_refresh_task(
    cache: Arc<RemoteKeyCache>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup does not
        // double-fetch with the first request.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = cache.refresh().await {
                        warn!(error = %e, "Background key refresh failed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Key refresh task shutting down");
                    break;
                }
            }
        }
    })
}
