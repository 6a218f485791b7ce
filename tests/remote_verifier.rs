//! Remote verification tests
//!
//! A verifier that holds no private key, fed by an in-process key source or
//! by a real issuer on a loopback port.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokenward::config::{FailMode, RemoteConfig, RotationPolicy, TokensConfig};
use tokenward::failsafe::RetryPolicy;
use tokenward::keys::{KeyManager, PublishedKey};
use tokenward::remote::{
    FetchError, HttpKeySource, KeySource, RemoteKeyCache, RemoteVerifier, RevocationChecker,
};
use tokenward::server::auth::{TokenVerifier, VerifyOutcome};
use tokenward::token::TokenError;

use common::{Authority, fast_retry, user};

const CACHE_TTL: Duration = Duration::from_secs(300);

/// Publishes an authority's verification keys, with a switch to simulate an
/// outage.
struct AuthoritySource {
    keys: Arc<KeyManager>,
    down: AtomicBool,
    fetches: AtomicUsize,
    latency: Duration,
}

impl AuthoritySource {
    fn new(authority: &Authority) -> Arc<Self> {
        Arc::new(Self {
            keys: Arc::clone(authority.service.keys()),
            down: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            latency: Duration::from_millis(50),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl KeySource for AuthoritySource {
    async fn health(&self) -> Result<(), FetchError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(FetchError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn fetch_keys(&self) -> Result<Vec<PublishedKey>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(self
            .keys
            .verification_keys()
            .iter()
            .map(PublishedKey::from)
            .collect())
    }
}

fn verifier(authority: &Authority, source: Arc<AuthoritySource>, mode: FailMode) -> RemoteVerifier {
    let cache = RemoteKeyCache::new(
        source,
        CACHE_TTL,
        RetryPolicy::new(&fast_retry(3)),
        authority.clock.clone(),
    );
    RemoteVerifier::new(
        Arc::new(cache),
        None,
        mode,
        Some("tokenward".to_string()),
        authority.clock.clone(),
    )
}

fn verified(outcome: Result<VerifyOutcome, TokenError>) -> tokenward::token::Claims {
    match outcome {
        Ok(VerifyOutcome::Verified(claims)) => claims,
        other => panic!("expected verified claims, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_first_requests_share_one_fetch() {
    // GIVEN: a cold cache and many requests arriving at once
    let authority = Authority::new().await;
    let source = AuthoritySource::new(&authority);
    let verifier = Arc::new(verifier(&authority, source.clone(), FailMode::Closed));
    let pair = authority
        .service
        .issue_token_pair(&user("alice@example.com"), &["user".to_string()])
        .unwrap();

    // WHEN
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let verifier = Arc::clone(&verifier);
            let token = pair.access_token.clone();
            tokio::spawn(async move { verifier.validate_token(&token).await })
        })
        .collect();
    let results = futures::future::join_all(tasks).await;

    // THEN: every request verifies and the issuer saw a single fetch
    for result in results {
        let claims = verified(result.unwrap());
        assert_eq!(claims.roles, vec!["user".to_string()]);
    }
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn stale_keys_survive_issuer_outage() {
    // GIVEN: a cache that fetched once, then the issuer goes away
    let authority = Authority::new().await;
    let source = AuthoritySource::new(&authority);
    let verifier = verifier(&authority, source.clone(), FailMode::Closed);
    let pair = authority
        .service
        .issue_token_pair(&user("bob@example.com"), &[])
        .unwrap();
    verified(verifier.validate_token(&pair.access_token).await);
    source.go_down();

    // WHEN: the cache expires and the refresh fails three times
    authority.clock.advance(CACHE_TTL + Duration::from_secs(1));
    let outcome = verifier.validate_token(&pair.access_token).await;

    // THEN: the stale key still verifies and the degradation was counted
    verified(outcome);
    let cache = verifier.cache();
    assert_eq!(cache.fetch_count(), 1 + 3);
    assert_eq!(cache.degraded_count(), 1);
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn fail_closed_rejects_without_any_key() {
    let authority = Authority::new().await;
    let source = AuthoritySource::new(&authority);
    source.go_down();
    let verifier = verifier(&authority, source, FailMode::Closed);
    let pair = authority
        .service
        .issue_token_pair(&user("carol@example.com"), &[])
        .unwrap();

    let outcome = verifier.validate_token(&pair.access_token).await;

    assert_eq!(outcome, Err(TokenError::KeyFetchFailure));
    assert!(!verifier.cache().has_keys());
}

#[tokio::test]
async fn fail_open_bypasses_without_any_key() {
    let authority = Authority::new().await;
    let source = AuthoritySource::new(&authority);
    source.go_down();
    let verifier = verifier(&authority, source, FailMode::Open);
    let pair = authority
        .service
        .issue_token_pair(&user("dave@example.com"), &[])
        .unwrap();

    let outcome = verifier.validate_token(&pair.access_token).await;

    assert_eq!(outcome, Ok(VerifyOutcome::Bypass));
}

#[tokio::test]
async fn unknown_kid_refetches_once_per_floor() {
    // GIVEN: a warm cache, then the issuer rotates
    let authority = Authority::new().await;
    let source = AuthoritySource::new(&authority);
    let verifier = verifier(&authority, source.clone(), FailMode::Closed);
    let old = authority
        .service
        .issue_token_pair(&user("erin@example.com"), &[])
        .unwrap();
    verified(verifier.validate_token(&old.access_token).await);

    authority.service.keys().rotate().await.unwrap();
    authority.clock.advance(Duration::from_secs(11));
    let new = authority
        .service
        .issue_token_pair(&user("erin@example.com"), &[])
        .unwrap();

    // WHEN: a token signed by the new key arrives
    let claims = verified(verifier.validate_token(&new.access_token).await);

    // THEN: one refetch picked the new key up, and the old key still works
    assert_eq!(claims.kid, authority.service.keys().active_key().kid);
    assert_eq!(source.fetches(), 2);
    verified(verifier.validate_token(&old.access_token).await);

    // AND: a kid nobody published does not trigger another fetch right away
    let stranger = Authority::new().await;
    let forged = stranger
        .service
        .issue_token_pair(&user("mallory@example.com"), &[])
        .unwrap();
    assert_eq!(
        verifier.validate_token(&forged.access_token).await,
        Err(TokenError::UnknownSigningKey)
    );
    assert_eq!(source.fetches(), 2);
}

#[tokio::test]
async fn remote_requests_need_an_access_token() {
    let authority = Authority::new().await;
    let source = AuthoritySource::new(&authority);
    let verifier = verifier(&authority, source, FailMode::Closed);
    let pair = authority
        .service
        .issue_token_pair(&user("fay@example.com"), &[])
        .unwrap();

    verified(verifier.verify(&pair.access_token).await);
    assert_eq!(
        verifier.verify(&pair.refresh_token).await,
        Err(TokenError::WrongTokenType)
    );
}

#[tokio::test]
async fn expired_token_is_rejected_remotely() {
    let authority = Authority::new().await;
    let source = AuthoritySource::new(&authority);
    let verifier = verifier(&authority, source, FailMode::Closed);
    let pair = authority
        .service
        .issue_token_pair(&user("frank@example.com"), &[])
        .unwrap();

    authority.clock.advance(Duration::from_secs(15 * 60));

    assert_eq!(
        verifier.validate_token(&pair.access_token).await,
        Err(TokenError::TokenExpired)
    );
}

#[tokio::test]
async fn static_key_verifies_without_fetching() {
    // GIVEN: a verifier configured with the issuer's public key
    let authority = Authority::new().await;
    let active = authority.service.keys().active_key();
    let config = RemoteConfig {
        static_public_key_pem: Some(active.public_key_pem),
        static_key_id: Some(active.kid),
        issuer: Some("tokenward".to_string()),
        revocation_check: false,
        ..RemoteConfig::default()
    };
    let verifier = RemoteVerifier::from_config(&config, authority.clock.clone()).unwrap();
    let pair = authority
        .service
        .issue_token_pair(&user("gina@example.com"), &[])
        .unwrap();

    // THEN: its tokens verify, tokens from another issuer do not
    verified(verifier.validate_token(&pair.access_token).await);
    let stranger = Authority::new().await;
    let other = stranger
        .service
        .issue_token_pair(&user("gina@example.com"), &[])
        .unwrap();
    assert_eq!(
        verifier.validate_token(&other.access_token).await,
        Err(TokenError::UnknownSigningKey)
    );
    assert_eq!(verifier.cache().fetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn background_refresh_runs_without_requests() {
    // GIVEN: a verifier with a proactive refresh interval and no traffic
    let authority = Authority::new().await;
    let source = AuthoritySource::new(&authority);
    let interval = Duration::from_secs(30 * 60);
    let verifier = verifier(&authority, source.clone(), FailMode::Closed).with_refresh_interval(interval);
    let (shutdown, rx) = tokio::sync::broadcast::channel(1);
    let task = verifier.spawn_background(rx).unwrap();

    // WHEN: one interval passes
    tokio::time::sleep(interval + Duration::from_secs(1)).await;

    // THEN: the key set was fetched in the background
    assert_eq!(source.fetches(), 1);
    assert!(verifier.cache().has_keys());

    shutdown.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn http_source_reads_published_keys() {
    // GIVEN: an issuer mid-rotation on a loopback port
    let authority = Authority::with(TokensConfig::default(), RotationPolicy::default()).await;
    let previous = authority.service.keys().active_key().kid;
    let current = authority.service.keys().rotate().await.unwrap().kid;
    let base = authority.serve().await;
    let source = HttpKeySource::new(&base, Duration::from_secs(5)).unwrap();

    // WHEN
    source.health().await.unwrap();
    let keys = source.fetch_keys().await.unwrap();

    // THEN: active and retiring keys are both published
    let kids: Vec<String> = keys.into_iter().map(|k| k.kid).collect();
    assert_eq!(kids, vec![current, previous]);
}

#[tokio::test]
async fn remote_verifier_honours_issuer_revocations() {
    // GIVEN: a verifier pointed at a live issuer with revocation checks on
    let authority = Authority::new().await;
    let base = authority.serve().await;
    let config = RemoteConfig {
        issuer_url: Some(base),
        issuer: Some("tokenward".to_string()),
        revocation_check: true,
        retry: fast_retry(2),
        ..RemoteConfig::default()
    };
    let verifier = RemoteVerifier::from_config(&config, authority.clock.clone()).unwrap();
    let pair = authority
        .service
        .issue_token_pair(&user("hank@example.com"), &[])
        .unwrap();
    verified(verifier.validate_token(&pair.access_token).await);

    // WHEN: the issuer revokes the access token
    authority
        .service
        .revoke_token(&pair.access_token)
        .await
        .unwrap();

    // THEN: the remote verifier rejects it on the next request
    assert_eq!(
        verifier.validate_token(&pair.access_token).await,
        Err(TokenError::TokenRevoked)
    );
}

#[tokio::test]
async fn revocation_checker_confirms_valid_tokens_only() {
    let authority = Authority::new().await;
    let base = authority.serve().await;
    let checker = RevocationChecker::new(&base, Duration::from_secs(5)).unwrap();
    let pair = authority
        .service
        .issue_token_pair(&user("ivy@example.com"), &[])
        .unwrap();

    assert!(!checker.is_token_revoked(&pair.access_token).await);
    assert!(checker.is_token_revoked("garbage").await);
}
