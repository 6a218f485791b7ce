//! Token endpoints exercised through the router

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    http::{HeaderMap, Request, StatusCode, header},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokenward::server::auth::{TokenVerifier, VerifyOutcome};
use tokenward::server::{AppState, build_router};
use tokenward::token::TokenError;
use tower::ServiceExt;

use common::{Authority, user};

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_bearer(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_reports_active_key() {
    let authority = Authority::new().await;
    let router = authority.router();

    let (status, headers, body) = send(&router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(
        body["active_kid"],
        authority.service.keys().active_key().kid.as_str()
    );
}

#[tokio::test]
async fn public_key_is_served_as_pem() {
    let authority = Authority::new().await;
    let router = authority.router();
    let active = authority.service.keys().active_key();

    let (status, headers, body) = send(&router, get("/auth/public-key")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/x-pem-file");
    assert_eq!(headers["x-key-id"], active.kid.as_str());
    assert_eq!(String::from_utf8(body.to_vec()).unwrap(), active.public_key_pem);
}

#[tokio::test]
async fn key_set_lists_active_then_retiring() {
    let authority = Authority::new().await;
    let router = authority.router();
    let previous = authority.service.keys().active_key().kid;
    let current = authority.service.keys().rotate().await.unwrap().kid;

    let (status, _, body) = send(&router, get("/auth/keys")).await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0]["kid"], current.as_str());
    assert_eq!(keys[0]["state"], "active");
    assert_eq!(keys[1]["kid"], previous.as_str());
    assert_eq!(keys[1]["state"], "retiring");
    assert_eq!(keys[0]["alg"], "ES256");
}

#[tokio::test]
async fn validate_accepts_good_tokens_and_hides_failure_reasons() {
    let authority = Authority::new().await;
    let router = authority.router();
    let alice = user("alice@example.com");
    let pair = authority
        .service
        .issue_token_pair(&alice, &["user".to_string()])
        .unwrap();

    let (status, _, body) = send(&router, post_bearer("/auth/validate", &pair.access_token)).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["valid"], true);
    assert_eq!(body["sub"], alice.id.to_string());
    assert_eq!(body["roles"], json!(["user"]));

    // missing and malformed tokens get the same opaque answer
    let anonymous = Request::builder()
        .method("POST")
        .uri("/auth/validate")
        .body(Body::empty())
        .unwrap();
    let (status, headers, missing) = send(&router, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
    let (status, _, garbage) = send(&router, post_bearer("/auth/validate", "not-a-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing, garbage);
}

#[tokio::test]
async fn refresh_endpoint_rotates_refresh_tokens() {
    let authority = Authority::new().await;
    let router = authority.router();
    let pair = authority
        .service
        .issue_token_pair(&user("bob@example.com"), &[])
        .unwrap();
    let body = json!({ "refresh_token": pair.refresh_token });

    let (status, _, fresh) = send(&router, post_json("/auth/refresh", &body)).await;
    assert_eq!(status, StatusCode::OK);
    let fresh: Value = serde_json::from_slice(&fresh).unwrap();
    assert_eq!(fresh["token_type"], "Bearer");
    let access = fresh["access_token"].as_str().unwrap();
    authority.service.validate_token(access).await.unwrap();

    // the old refresh token is spent
    let (status, _, _) = send(&router, post_json("/auth/refresh", &body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_revokes_both_tokens() {
    let authority = Authority::new().await;
    let router = authority.router();
    let pair = authority
        .service
        .issue_token_pair(&user("carol@example.com"), &[])
        .unwrap();

    let (status, _, _) = send(
        &router,
        post_json(
            "/auth/logout",
            &json!({
                "refresh_token": pair.refresh_token,
                "access_token": pair.access_token,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = send(&router, post_bearer("/auth/validate", &pair.access_token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = send(
        &router,
        post_json("/auth/refresh", &json!({ "refresh_token": pair.refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn failed_logout_changes_nothing() {
    // GIVEN: a logout carrying a good refresh token and a bad access token
    let authority = Authority::new().await;
    let router = authority.router();
    let pair = authority
        .service
        .issue_token_pair(&user("erin@example.com"), &[])
        .unwrap();
    let body = json!({
        "refresh_token": pair.refresh_token,
        "access_token": "not-a-token",
    });

    // WHEN
    let (status, _, _) = send(&router, post_json("/auth/logout", &body)).await;

    // THEN: the request fails and the refresh token is still usable
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = send(
        &router,
        post_json("/auth/refresh", &json!({ "refresh_token": pair.refresh_token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn me_requires_a_token() {
    let authority = Authority::new().await;
    let router = authority.router();
    let pair = authority
        .service
        .issue_token_pair(&user("dave@example.com"), &["viewer".to_string()])
        .unwrap();

    let (status, _, _) = send(&router, get("/auth/me")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/auth/me")
        .header(header::AUTHORIZATION, format!("Bearer {}", pair.access_token))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["email"], "dave@example.com");
    assert_eq!(body["roles"], json!(["viewer"]));
}

/// A verifier that never answers in time.
struct StalledVerifier;

#[async_trait::async_trait]
impl TokenVerifier for StalledVerifier {
    async fn verify(&self, _token: &str) -> Result<VerifyOutcome, TokenError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(TokenError::KeyFetchFailure)
    }
}

#[tokio::test(start_paused = true)]
async fn slow_requests_time_out_with_408() {
    let authority = Authority::new().await;
    let state = AppState {
        tokens: authority.service.clone(),
        verifier: Arc::new(StalledVerifier),
    };
    let router = build_router(state, Duration::from_millis(100));
    let request = Request::builder()
        .uri("/auth/me")
        .header(header::AUTHORIZATION, "Bearer anything")
        .body(Body::empty())
        .unwrap();

    let (status, _, _) = send(&router, request).await;

    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
}
