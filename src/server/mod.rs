//! HTTP surface of the issuing service.

pub mod admin;
pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, KeysConfig, expand_home};
use crate::keys::{FileKeyStore, InMemoryKeyStore, KeyManager, KeyStore, spawn_rotation_task};
use crate::rbac::InMemoryRbacStore;
use crate::token::{InMemoryRevocationStore, RevocationStore, TokenService, spawn_reaper};
use crate::{Error, Result};

use self::auth::{RequiredRole, TokenVerifier, authenticate, require_auth, require_role};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Issuing token service
    pub tokens: Arc<TokenService>,
    /// Verifier used by the authentication layer
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    /// State whose authentication layer verifies with the token service
    /// itself.
    #[must_use]
    pub fn new(tokens: Arc<TokenService>) -> Self {
        let verifier: Arc<dyn TokenVerifier> = tokens.clone();
        Self { tokens, verifier }
    }
}

/// Build the router with all routes and layers.
///
/// Public routes skip the authentication layer entirely so a stale
/// `Authorization` header cannot block refresh or logout.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let me = Router::new()
        .route("/auth/me", get(handlers::me))
        .route_layer(middleware::from_fn(require_auth));

    let admin = admin::routes().route_layer(middleware::from_fn_with_state(
        RequiredRole::new("admin"),
        require_role,
    ));

    let protected = Router::new()
        .route("/auth/validate", post(handlers::validate))
        .merge(me)
        .merge(admin)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.verifier),
            authenticate,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/keys", get(handlers::keys))
        .route("/auth/public-key", get(handlers::public_key))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/logout", post(handlers::logout))
        .merge(protected)
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Open the key store named by `keys.store_dir`, or an in-memory one.
///
/// # Errors
///
/// The key directory cannot be created or read.
pub async fn open_key_store(keys: &KeysConfig) -> Result<Arc<dyn KeyStore>> {
    match &keys.store_dir {
        Some(dir) => {
            let store = FileKeyStore::open(expand_home(dir)).await?;
            info!(dir = %store.dir().display(), "Using file key store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("keys.store_dir not set: signing keys live in memory and die with the process");
            Ok(Arc::new(InMemoryKeyStore::new()))
        }
    }
}

/// Load (or create) signing keys for `config`.
///
/// # Errors
///
/// The key store cannot be opened or no signing key can be established.
pub async fn bootstrap_keys(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<KeyManager>> {
    let store = open_key_store(&config.keys).await?;
    let manager = KeyManager::bootstrap(
        store,
        config.keys.algorithm,
        config.keys.rotation.clone(),
        config.tokens.max_token_lifetime(),
        clock,
    )
    .await?;
    Ok(Arc::new(manager))
}

/// The issuing service
pub struct Server {
    config: Config,
    tokens: Arc<TokenService>,
    revocations: Arc<dyn RevocationStore>,
    clock: Arc<dyn Clock>,
}

impl Server {
    /// Create a new server: keys, revocation store, RBAC store and token
    /// service.
    ///
    /// # Errors
    ///
    /// Key bootstrap failure. The service never starts without a signing key.
    pub async fn new(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let keys = bootstrap_keys(&config, Arc::clone(&clock)).await?;
        let revocations: Arc<dyn RevocationStore> = Arc::new(InMemoryRevocationStore::new());
        let tokens = Arc::new(TokenService::new(
            keys,
            Arc::clone(&revocations),
            Arc::new(InMemoryRbacStore::new()),
            Arc::clone(&clock),
            config.tokens.clone(),
        ));

        Ok(Self {
            config,
            tokens,
            revocations,
            clock,
        })
    }

    /// The token service, for embedding callers that issue pairs directly.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// Run until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Invalid bind address, bind failure or a server error.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {e}")))?;

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let rotation = spawn_rotation_task(Arc::clone(self.tokens.keys()), shutdown_tx.subscribe());
        let reaper = spawn_reaper(
            Arc::clone(&self.revocations),
            Arc::clone(&self.clock),
            self.config.tokens.revocation_reap_interval,
            shutdown_tx.subscribe(),
        );

        let app = build_router(
            AppState::new(Arc::clone(&self.tokens)),
            self.config.server.request_timeout,
        );

        let listener = TcpListener::bind(addr).await?;
        info!(
            %addr,
            kid = %self.tokens.keys().active_key().kid,
            issuer = %self.config.tokens.issuer,
            "tokenward listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let _ = tokio::join!(rotation, reaper);
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
