//! Configuration management

use std::{path::Path, time::Duration};

use chrono::TimeDelta;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::keys::KeyAlgorithm;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Signing key lifecycle configuration
    pub keys: KeysConfig,
    /// Token issuance configuration
    pub tokens: TokensConfig,
    /// Remote verifier configuration (services without private keys)
    pub remote: RemoteConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // TOKENWARD_TOKENS__ACCESS_TTL=5m -> tokens.access_ttl
        figment = figment.merge(Env::prefixed("TOKENWARD_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Reject configurations that would break key lifecycle invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if !self.keys.algorithm.can_sign() {
            return Err(Error::Config(format!(
                "keys.algorithm {} cannot be used for signing",
                self.keys.algorithm
            )));
        }
        if self.tokens.access_ttl.is_zero() || self.tokens.refresh_ttl.is_zero() {
            return Err(Error::Config("token lifetimes must be non-zero".to_string()));
        }
        if self.tokens.access_ttl >= self.tokens.refresh_ttl {
            return Err(Error::Config(
                "tokens.access_ttl must be shorter than tokens.refresh_ttl".to_string(),
            ));
        }
        for (name, interval) in [
            ("keys.rotation.check_interval", self.keys.rotation.check_interval),
            ("tokens.revocation_reap_interval", self.tokens.revocation_reap_interval),
            ("remote.refresh_interval", self.remote.refresh_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        if self.remote.static_public_key_pem.is_some() != self.remote.static_key_id.is_some() {
            return Err(Error::Config(
                "remote.static_public_key_pem and remote.static_key_id must be set together"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

/// Expand a leading `~` to the user's home directory.
#[must_use]
pub fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39480,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Algorithm for newly generated keys
    pub algorithm: KeyAlgorithm,
    /// Directory for the file-backed key store. `None` keeps keys in memory
    /// only (every restart then invalidates all outstanding tokens).
    pub store_dir: Option<String>,
    /// Rotation policy
    pub rotation: RotationPolicy,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            algorithm: KeyAlgorithm::Es256,
            store_dir: None,
            rotation: RotationPolicy::default(),
        }
    }
}

/// What triggers a rotation of the active signing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationTrigger {
    /// Rotate when the active key is older than `interval_days`
    #[default]
    Time,
    /// Rotate when the active key has signed `max_tokens_per_key` tokens
    Count,
}

/// Rotation policy for the active signing key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Trigger type
    pub trigger: RotationTrigger,
    /// Maximum key age in days (time trigger)
    pub interval_days: u32,
    /// Maximum tokens signed by one key (count trigger)
    pub max_tokens_per_key: u64,
    /// How long a demoted key stays valid for verification
    pub overlap_minutes: u64,
    /// How often the rotation task wakes up
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
}

impl RotationPolicy {
    /// Overlap window as a chrono delta
    #[must_use]
    pub fn overlap(&self) -> TimeDelta {
        i64::try_from(self.overlap_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX)
    }

    /// Maximum key age as a chrono delta
    #[must_use]
    pub fn max_age(&self) -> TimeDelta {
        TimeDelta::try_days(i64::from(self.interval_days)).unwrap_or(TimeDelta::MAX)
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            trigger: RotationTrigger::Time,
            interval_days: 30,
            max_tokens_per_key: 1_000_000,
            overlap_minutes: 60,
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Token issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// `iss` claim written into and required on every token
    pub issuer: String,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_ttl: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,
    /// How often expired revocation records are purged
    #[serde(with = "humantime_serde")]
    pub revocation_reap_interval: Duration,
}

impl TokensConfig {
    /// Longest lifetime of any token this service issues
    #[must_use]
    pub fn max_token_lifetime(&self) -> Duration {
        self.access_ttl.max(self.refresh_ttl)
    }
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            issuer: "tokenward".to_string(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 3600),
            revocation_reap_interval: Duration::from_secs(600),
        }
    }
}

/// Behaviour when no verification key has ever been obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Reject every token until a key is available
    #[default]
    Closed,
    /// Disable verification and let requests through unauthenticated
    Open,
}

/// Remote verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the issuing service (e.g. `http://auth:39480`)
    pub issuer_url: Option<String>,
    /// Expected `iss` claim; `None` skips the issuer check
    pub issuer: Option<String>,
    /// How long fetched keys are considered fresh
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Proactive background refresh interval
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Timeout for health probe, key fetch and revocation check
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Key fetch retry policy
    pub retry: RetryConfig,
    /// What to do before any key has been fetched
    pub fail_mode: FailMode,
    /// Call the issuer's validation endpoint on every request
    pub revocation_check: bool,
    /// Statically configured public key (PEM); disables fetching
    pub static_public_key_pem: Option<String>,
    /// Key id that tokens signed by the static key carry
    pub static_key_id: Option<String>,
    /// Algorithm of the static key
    pub algorithm: KeyAlgorithm,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            issuer_url: None,
            issuer: None,
            cache_ttl: Duration::from_secs(3600),
            refresh_interval: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            fail_mode: FailMode::Closed,
            revocation_check: true,
            static_public_key_pem: None,
            static_key_id: None,
            algorithm: KeyAlgorithm::Es256,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts (including the first)
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string ("100ms", "30s", "5m", "2h", "7d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
