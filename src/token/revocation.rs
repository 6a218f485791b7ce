//! Revocation records.
//!
//! A record marks a `jti` as revoked until the token's natural expiry; after
//! that the signature check alone rejects the token and the record is garbage
//! collected by [`spawn_reaper`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::Clock;
use crate::error::StorageError;

/// A revoked token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    /// Token id
    pub jti: String,
    /// When it was revoked
    pub revoked_at: DateTime<Utc>,
    /// The token's own `exp`
    pub natural_expiry: DateTime<Utc>,
}

/// Trait abstracting the revocation storage backend.
#[async_trait::async_trait]
pub trait RevocationStore: Send + Sync + 'static {
    /// Record a revocation.
    ///
    /// Returns `true` if this call inserted the record and `false` if the
    /// token was already revoked. The check and insert are atomic, so at most
    /// one concurrent caller sees `true` for a given `jti`.
    async fn revoke(&self, record: RevocationRecord) -> Result<bool, StorageError>;

    /// Whether `jti` has been revoked.
    async fn is_revoked(&self, jti: &str) -> Result<bool, StorageError>;

    /// Remove records whose natural expiry is at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// In-memory revocation store backed by a `DashMap`.
#[derive(Default)]
pub struct InMemoryRevocationStore {
    records: DashMap<String, RevocationRecord>,
}

impl InMemoryRevocationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait::async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn revoke(&self, record: RevocationRecord) -> Result<bool, StorageError> {
        match self.records.entry(record.jti.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, StorageError> {
        Ok(self.records.contains_key(jti))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let before = self.records.len();
        self.records.retain(|_, r| r.natural_expiry > now);
        Ok(before.saturating_sub(self.records.len()))
    }
}

/// Spawn a background task that purges expired revocation records every
/// `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn RevocationStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.purge_expired(clock.now()).await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Purged expired revocation records"),
                        Err(e) => tracing::warn!(error = %e, "Revocation reaper failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Revocation reaper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn record(jti: &str, expires_in: TimeDelta) -> RevocationRecord {
        let now = Utc::now();
        RevocationRecord {
            jti: jti.to_string(),
            revoked_at: now,
            natural_expiry: now + expires_in,
        }
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        // GIVEN: an empty store
        let store = InMemoryRevocationStore::new();

        // WHEN: the same jti is revoked twice
        let first = store.revoke(record("j1", TimeDelta::hours(1))).await.unwrap();
        let second = store.revoke(record("j1", TimeDelta::hours(1))).await.unwrap();

        // THEN: only the first insert reports new, and one record exists
        assert!(first);
        assert!(!second);
        assert_eq!(store.len(), 1);
        assert!(store.is_revoked("j1").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_jti_is_not_revoked() {
        let store = InMemoryRevocationStore::new();

        assert!(!store.is_revoked("nope").await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_expired_records() {
        // GIVEN: one expired and one live record
        let store = InMemoryRevocationStore::new();
        store.revoke(record("old", TimeDelta::seconds(-5))).await.unwrap();
        store.revoke(record("live", TimeDelta::hours(1))).await.unwrap();

        // WHEN
        let purged = store.purge_expired(Utc::now()).await.unwrap();

        // THEN
        assert_eq!(purged, 1);
        assert!(!store.is_revoked("old").await.unwrap());
        assert!(store.is_revoked("live").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_revokes_have_one_winner() {
        let store = Arc::new(InMemoryRevocationStore::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let s = Arc::clone(&store);
                tokio::spawn(async move { s.revoke(record("race", TimeDelta::hours(1))).await.unwrap() })
            })
            .collect();
        let results = futures::future::join_all(handles).await;

        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }
}
