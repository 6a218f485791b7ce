//! Signing key lifecycle.
//!
//! [`KeyManager`] owns every signing key the service knows about. Exactly one
//! key is active and signs new tokens; keys demoted by a rotation stay in the
//! ring as `retiring` until their overlap window ends, and are then moved to
//! `retired` by the reaper. Private key material never leaves the manager:
//! callers see [`SigningKey`] (public view) or sign through
//! [`KeyManager::signer`].
//!
//! # Concurrency
//!
//! The ring sits behind a `parking_lot::RwLock`. Readers (token signing and
//! verification) take the read lock for a pointer copy. Rotations are
//! serialized by an async mutex, do key generation and persistence without
//! holding the ring lock, and swap the new key in under one short write lock,
//! so no reader ever observes a ring without an active key.

pub mod algorithm;
pub mod rotation;
pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use algorithm::KeyAlgorithm;
pub use rotation::{rotation_due, spawn_rotation_task};
pub use store::{
    FileKeyStore, InMemoryKeyStore, KeySet, KeyState, KeyStore, PublishedKey, SigningKey,
    StoredKey,
};

use crate::audit::{self, AuditEvent};
use crate::clock::{Clock, delta};
use crate::config::RotationPolicy;
use crate::error::StorageError;

/// Key generation, parsing and persistence errors
#[derive(Error, Debug)]
pub enum KeyError {
    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    Generation(String),

    /// The algorithm is verification-only
    #[error("algorithm {0} cannot be used for signing")]
    SigningUnsupported(KeyAlgorithm),

    /// PEM material could not be parsed for the declared algorithm
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(#[from] jsonwebtoken::errors::Error),

    /// Key store failure
    #[error("key store error: {0}")]
    Storage(#[from] StorageError),
}

/// A key in the ring together with its parsed material.
pub(crate) struct KeyHandle {
    meta: SigningKey,
    encoding: Option<EncodingKey>,
    decoding: DecodingKey,
    issued: AtomicU64,
}

impl KeyHandle {
    fn new(meta: SigningKey, encoding: Option<EncodingKey>, decoding: DecodingKey) -> Self {
        let issued = AtomicU64::new(meta.tokens_issued);
        Self {
            meta,
            encoding,
            decoding,
            issued,
        }
    }

    /// Public metadata with the live issuance counter.
    fn snapshot(&self) -> SigningKey {
        SigningKey {
            tokens_issued: self.issued.load(Ordering::Relaxed),
            ..self.meta.clone()
        }
    }

    pub(crate) fn kid(&self) -> &str {
        &self.meta.kid
    }

    pub(crate) fn algorithm(&self) -> KeyAlgorithm {
        self.meta.algorithm
    }

    pub(crate) fn decoding(&self) -> &DecodingKey {
        &self.decoding
    }

    /// Whether this key still verifies at `now` (retiring keys stop at `retire_at`).
    fn verifies_at(&self, now: DateTime<Utc>) -> bool {
        self.meta.retire_at.is_none_or(|at| now < at)
    }

    /// Signing key. Only the active handle has one.
    pub(crate) fn encoding(&self) -> Option<&EncodingKey> {
        self.encoding.as_ref()
    }
}

struct KeyRing {
    active: Arc<KeyHandle>,
    retiring: Vec<Arc<KeyHandle>>,
    retired: Vec<SigningKey>,
}

/// Result of one reaper pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// Keys moved from `retiring` to `retired`
    pub retired: Vec<String>,
    /// Retired keys whose material was deleted
    pub purged: Vec<String>,
}

/// Owner of the signing key ring.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    algorithm: KeyAlgorithm,
    policy: RotationPolicy,
    max_token_lifetime: TimeDelta,
    clock: Arc<dyn Clock>,
    ring: RwLock<KeyRing>,
    rotation_lock: tokio::sync::Mutex<()>,
}

impl KeyManager {
    /// Load keys from `store` and make sure an active key exists.
    ///
    /// The newest stored `active` key becomes active; any other `active`
    /// record (left by a crash mid-rotation) is demoted to `retiring`. When no
    /// usable active key exists a new one is generated.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read or a first key cannot be generated
    /// and persisted. The service must not start without a signing key.
    pub async fn bootstrap(
        store: Arc<dyn KeyStore>,
        algorithm: KeyAlgorithm,
        policy: RotationPolicy,
        max_token_lifetime: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KeyError> {
        if !algorithm.can_sign() {
            return Err(KeyError::SigningUnsupported(algorithm));
        }

        let now = clock.now();
        let overlap_end = now.checked_add_signed(policy.overlap()).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut stored = store.list().await?;
        stored.sort_by(|a, b| b.key.created_at.cmp(&a.key.created_at));

        let mut active: Option<Arc<KeyHandle>> = None;
        let mut retiring = Vec::new();
        let mut retired = Vec::new();

        for record in stored {
            let StoredKey {
                key: mut meta,
                private_key_pem,
            } = record;

            if meta.state == KeyState::Retired {
                retired.push(meta);
                continue;
            }

            let decoding = match meta.algorithm.decoding_key(&meta.public_key_pem) {
                Ok(d) => d,
                Err(e) => {
                    warn!(kid = %meta.kid, error = %e, "Stored public key unusable, skipping");
                    continue;
                }
            };

            if meta.state == KeyState::Active && active.is_none() {
                match meta.algorithm.encoding_key(&private_key_pem) {
                    Ok(encoding) => {
                        info!(kid = %meta.kid, algorithm = %meta.algorithm, "Restored active signing key");
                        active = Some(Arc::new(KeyHandle::new(meta, Some(encoding), decoding)));
                        continue;
                    }
                    Err(e) => {
                        warn!(kid = %meta.kid, error = %e, "Stored private key unusable, demoting");
                    }
                }
            }

            if meta.state == KeyState::Active {
                meta.state = KeyState::Retiring;
                meta.retire_at = Some(overlap_end);
                if let Err(e) = store.update(&meta).await {
                    warn!(kid = %meta.kid, error = %e, "Failed to persist demotion of stale active key");
                }
            }
            retiring.push(Arc::new(KeyHandle::new(meta, None, decoding)));
        }

        let active = match active {
            Some(handle) => handle,
            None => {
                let handle = create_key(store.as_ref(), algorithm, now).await?;
                info!(kid = %handle.kid(), algorithm = %algorithm, "Generated initial signing key");
                Arc::new(handle)
            }
        };

        Ok(Self {
            store,
            algorithm,
            policy,
            max_token_lifetime: delta(max_token_lifetime),
            clock,
            ring: RwLock::new(KeyRing {
                active,
                retiring,
                retired,
            }),
            rotation_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Generate a new key, make it active and demote the previous active key
    /// to `retiring` with `retire_at = now + overlap`.
    ///
    /// # Errors
    ///
    /// Generation or persistence failure. The previous active key is left
    /// untouched in that case.
    pub async fn generate_key(&self) -> Result<SigningKey, KeyError> {
        let _guard = self.rotation_lock.lock().await;

        let now = self.clock.now();
        let fresh = Arc::new(create_key(self.store.as_ref(), self.algorithm, now).await?);

        let previous = Arc::clone(&self.ring.read().active);
        let mut demoted_meta = previous.snapshot();
        demoted_meta.state = KeyState::Retiring;
        demoted_meta.retire_at = Some(
            now.checked_add_signed(self.policy.overlap())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        if let Err(e) = self.store.update(&demoted_meta).await {
            // The ring is authoritative while running; a restart demotes it again
            warn!(kid = %demoted_meta.kid, error = %e, "Failed to persist key demotion");
        }
        let demoted = Arc::new(KeyHandle::new(demoted_meta, None, previous.decoding.clone()));

        let meta = fresh.snapshot();
        {
            let mut ring = self.ring.write();
            ring.retiring.push(demoted);
            ring.active = fresh;
        }

        info!(kid = %meta.kid, previous_kid = %previous.kid(), "Rotated signing key");
        audit::emit(&AuditEvent::key_rotated(&meta.kid, previous.kid()));
        Ok(meta)
    }

    /// Rotate the active key. Same as [`Self::generate_key`].
    pub async fn rotate(&self) -> Result<SigningKey, KeyError> {
        self.generate_key().await
    }

    /// Public view of the active key.
    #[must_use]
    pub fn active_key(&self) -> SigningKey {
        self.ring.read().active.snapshot()
    }

    /// All keys currently valid for verification (active first, then retiring
    /// keys still inside their overlap window).
    #[must_use]
    pub fn verification_keys(&self) -> Vec<SigningKey> {
        let now = self.clock.now();
        let ring = self.ring.read();
        std::iter::once(&ring.active)
            .chain(ring.retiring.iter().filter(|h| h.verifies_at(now)))
            .map(|h| h.snapshot())
            .collect()
    }

    /// Every key the manager knows about, including retired ones.
    #[must_use]
    pub fn all_keys(&self) -> Vec<SigningKey> {
        let ring = self.ring.read();
        std::iter::once(&ring.active)
            .chain(ring.retiring.iter())
            .map(|h| h.snapshot())
            .chain(ring.retired.iter().cloned())
            .collect()
    }

    /// Handle of the active key for signing.
    pub(crate) fn signer(&self) -> Arc<KeyHandle> {
        Arc::clone(&self.ring.read().active)
    }

    /// Verification material for `kid`, if it is active or inside its overlap
    /// window.
    pub(crate) fn verification_key(&self, kid: &str) -> Option<Arc<KeyHandle>> {
        let now = self.clock.now();
        let ring = self.ring.read();
        if ring.active.kid() == kid {
            return Some(Arc::clone(&ring.active));
        }
        ring.retiring
            .iter()
            .find(|h| h.kid() == kid && h.verifies_at(now))
            .map(Arc::clone)
    }

    /// Count one token signed with `handle`.
    pub(crate) fn record_issuance(&self, handle: &KeyHandle) {
        handle.issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the active key is due for rotation under the configured policy.
    #[must_use]
    pub fn needs_rotation(&self) -> bool {
        rotation_due(&self.policy, &self.active_key(), self.clock.now())
    }

    /// One ticker pass: rotate if due, then reap.
    ///
    /// Rotation failure is logged and retried on the next tick; the current
    /// active key stays in service.
    pub async fn tick(&self) -> ReapReport {
        if self.needs_rotation() {
            if let Err(e) = self.rotate().await {
                warn!(error = %e, "Key rotation failed, keeping current key");
            }
        }
        self.reap().await
    }

    /// Retire keys whose overlap window has passed and purge retired keys once
    /// every token they signed has expired.
    pub async fn reap(&self) -> ReapReport {
        let now = self.clock.now();
        let mut report = ReapReport::default();

        let newly_retired: Vec<SigningKey> = {
            let mut ring = self.ring.write();
            let (expired, keep): (Vec<_>, Vec<_>) = ring
                .retiring
                .drain(..)
                .partition(|h| h.meta.retire_at.is_some_and(|at| at <= now));
            ring.retiring = keep;

            let retired: Vec<SigningKey> = expired
                .iter()
                .map(|h| SigningKey {
                    state: KeyState::Retired,
                    retired_at: Some(now),
                    ..h.snapshot()
                })
                .collect();
            ring.retired.extend(retired.iter().cloned());
            retired
        };

        for key in newly_retired {
            if let Err(e) = self.store.update(&key).await {
                warn!(kid = %key.kid, error = %e, "Failed to persist key retirement");
            }
            info!(kid = %key.kid, "Retired signing key");
            audit::emit(&AuditEvent::key_retired(&key.kid));
            report.retired.push(key.kid);
        }

        let purgeable: Vec<String> = {
            let ring = self.ring.read();
            ring.retired
                .iter()
                .filter(|k| {
                    k.retired_at
                        .and_then(|at| at.checked_add_signed(self.max_token_lifetime))
                        .is_some_and(|deadline| deadline <= now)
                })
                .map(|k| k.kid.clone())
                .collect()
        };

        for kid in purgeable {
            match self.store.delete(&kid).await {
                Ok(_) => {
                    self.ring.write().retired.retain(|k| k.kid != kid);
                    info!(kid = %kid, "Purged retired signing key");
                    audit::emit(&AuditEvent::key_purged(&kid));
                    report.purged.push(kid);
                }
                Err(e) => warn!(kid = %kid, error = %e, "Failed to purge retired key"),
            }
        }

        if report != ReapReport::default() {
            debug!(retired = report.retired.len(), purged = report.purged.len(), "Key reaper pass");
        }
        report
    }

    /// Rotation policy in force.
    #[must_use]
    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }
}

/// Generate, parse and persist a new active key.
async fn create_key(
    store: &dyn KeyStore,
    algorithm: KeyAlgorithm,
    now: DateTime<Utc>,
) -> Result<KeyHandle, KeyError> {
    let generated = algorithm.generate()?;
    let encoding = algorithm.encoding_key(&generated.private_key_pem)?;
    let decoding = algorithm.decoding_key(&generated.public_key_pem)?;

    let meta = SigningKey {
        kid: generated.kid,
        algorithm,
        public_key_pem: generated.public_key_pem,
        created_at: now,
        state: KeyState::Active,
        retire_at: None,
        retired_at: None,
        tokens_issued: 0,
    };
    store
        .put(&StoredKey {
            key: meta.clone(),
            private_key_pem: generated.private_key_pem,
        })
        .await?;

    Ok(KeyHandle::new(meta, Some(encoding), decoding))
}
