//! tokenward
//!
//! Signed bearer token authority for a multi-service backend.
//!
//! # Features
//!
//! - **Key lifecycle**: ES256/EdDSA signing keys with time or count based
//!   rotation, an overlap window for in-flight tokens and a reaper
//! - **Token service**: issue, validate, refresh (single use) and revoke
//!   access/refresh pairs
//! - **Remote verification**: TTL cached public keys with single-flight
//!   refresh, retry with backoff, stale fallback and a fail-closed
//!   revocation check
//! - **RBAC**: roles, permissions and assignments with an admin API and
//!   role-gate middleware

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod keys;
pub mod rbac;
pub mod remote;
pub mod server;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// A global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
