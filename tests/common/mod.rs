//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokenward::clock::ManualClock;
use tokenward::config::{RetryConfig, RotationPolicy, TokensConfig};
use tokenward::keys::{InMemoryKeyStore, KeyAlgorithm, KeyManager, KeyStore};
use tokenward::rbac::InMemoryRbacStore;
use tokenward::server::{AppState, build_router};
use tokenward::token::{InMemoryRevocationStore, TokenService, UserIdentity};

/// An issuing service driven by a manual clock.
pub struct Authority {
    pub service: Arc<TokenService>,
    pub clock: Arc<ManualClock>,
    pub rbac: Arc<InMemoryRbacStore>,
    pub revocations: Arc<InMemoryRevocationStore>,
}

impl Authority {
    pub async fn new() -> Self {
        Self::with(TokensConfig::default(), RotationPolicy::default()).await
    }

    pub async fn with(tokens: TokensConfig, policy: RotationPolicy) -> Self {
        Self::with_store(tokens, policy, Arc::new(InMemoryKeyStore::new())).await
    }

    pub async fn with_store(
        tokens: TokensConfig,
        policy: RotationPolicy,
        store: Arc<dyn KeyStore>,
    ) -> Self {
        Self::with_clock(tokens, policy, store, Arc::new(ManualClock::starting_now())).await
    }

    pub async fn with_clock(
        tokens: TokensConfig,
        policy: RotationPolicy,
        store: Arc<dyn KeyStore>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let keys = KeyManager::bootstrap(
            store,
            KeyAlgorithm::Es256,
            policy,
            tokens.max_token_lifetime(),
            clock.clone(),
        )
        .await
        .unwrap();
        let revocations = Arc::new(InMemoryRevocationStore::new());
        let rbac = Arc::new(InMemoryRbacStore::new());
        let service = Arc::new(TokenService::new(
            Arc::new(keys),
            revocations.clone(),
            rbac.clone(),
            clock.clone(),
            tokens,
        ));
        Self {
            service,
            clock,
            rbac,
            revocations,
        }
    }

    pub fn router(&self) -> axum::Router {
        build_router(AppState::new(self.service.clone()), Duration::from_secs(30))
    }

    /// Serve the router on a loopback port and return its base URL.
    pub async fn serve(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}

pub fn user(email: &str) -> UserIdentity {
    UserIdentity {
        id: uuid::Uuid::new_v4(),
        email: email.to_string(),
    }
}

/// Retry settings with millisecond backoff so tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        enabled: true,
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    }
}
