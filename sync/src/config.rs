//! Configuration management for the sync runtime.

use std::env;
use std::time::Duration;
use workspot_engine::RetryPolicy;

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Maximum age before a cached record or region is re-validated
    pub freshness_window: Duration,
    /// Retries after the first failed push before a mutation is marked failed
    pub max_retry_count: u32,
    /// First backoff delay
    pub backoff_base: Duration,
    /// Upper bound for any single backoff delay
    pub backoff_cap: Duration,
    /// Concurrent remote fetches
    pub pull_concurrency_limit: usize,
    /// Records pushed concurrently by the drain loop
    pub push_concurrency_limit: usize,
    /// Deadline for every single gateway call
    pub remote_timeout: Duration,
    /// Clean, unsaved records not synced for this long may be evicted
    pub eviction_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(5 * 60),
            max_retry_count: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            pull_concurrency_limit: 4,
            push_concurrency_limit: 4,
            remote_timeout: Duration::from_secs(20),
            eviction_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(&lookup, var)?.map_or(default, Duration::from_secs))
        };
        let millis = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(&lookup, var)?.map_or(default, Duration::from_millis))
        };

        let config = Self {
            freshness_window: secs("WORKSPOT_FRESHNESS_WINDOW_SECS", defaults.freshness_window)?,
            max_retry_count: parse(&lookup, "WORKSPOT_MAX_RETRY_COUNT")?
                .unwrap_or(defaults.max_retry_count),
            backoff_base: millis("WORKSPOT_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_cap: millis("WORKSPOT_BACKOFF_CAP_MS", defaults.backoff_cap)?,
            pull_concurrency_limit: parse(&lookup, "WORKSPOT_PULL_CONCURRENCY")?
                .unwrap_or(defaults.pull_concurrency_limit),
            push_concurrency_limit: parse(&lookup, "WORKSPOT_PUSH_CONCURRENCY")?
                .unwrap_or(defaults.push_concurrency_limit),
            remote_timeout: millis("WORKSPOT_REMOTE_TIMEOUT_MS", defaults.remote_timeout)?,
            eviction_ttl: secs("WORKSPOT_EVICTION_TTL_SECS", defaults.eviction_ttl)?,
        };

        if config.pull_concurrency_limit == 0 {
            return Err(ConfigError::ZeroLimit("WORKSPOT_PULL_CONCURRENCY"));
        }
        if config.push_concurrency_limit == 0 {
            return Err(ConfigError::ZeroLimit("WORKSPOT_PUSH_CONCURRENCY"));
        }
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retry_count,
            base: self.backoff_base,
            cap: self.backoff_cap,
        }
    }

    pub fn freshness_window_ms(&self) -> u64 {
        self.freshness_window.as_millis() as u64
    }

    pub fn eviction_ttl_ms(&self) -> u64 {
        self.eviction_ttl.as_millis() as u64
    }
}

/// Client configuration for the `workspot` binary.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// SQLite connection URL for the local store
    pub database_url: String,
    /// Base URL of the remote workspace API
    pub remote_url: String,
    pub sync: SyncConfig,
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("WORKSPOT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://workspot.db".to_string());

        let remote_url = env::var("WORKSPOT_REMOTE_URL").map_err(|_| ConfigError::MissingRemoteUrl)?;

        Ok(Self {
            database_url,
            remote_url,
            sync: SyncConfig::from_env()?,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("WORKSPOT_REMOTE_URL environment variable is required")]
    MissingRemoteUrl,

    #[error("Invalid {var} value: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
}
