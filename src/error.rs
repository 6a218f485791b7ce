//! Error types for tokenward

use std::io;

use thiserror::Error;

/// Result type alias for tokenward
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors (startup, configuration, plumbing)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key could not be generated or loaded
    #[error("Key error: {0}")]
    Key(#[from] crate::keys::KeyError),

    /// Persistence backend error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by the persistence seams (key store, revocation store, RBAC store).
///
/// The in-memory implementations never produce these; database or file backed
/// implementations map their driver errors onto them.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Record could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Identifier is not acceptable to the backend (e.g. would escape the key directory)
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Opaque backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}
