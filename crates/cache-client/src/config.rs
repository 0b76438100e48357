//! Client configuration.

use crate::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Production service endpoint.
pub const PRODUCTION_URL: &str = "https://cache.appcelerator.com";

/// Pre-production service endpoint.
pub const PREPRODUCTION_URL: &str = "https://cache-preprod.cloud.appctest.com";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Deployment environment used to pick the default endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Preproduction,
}

impl Environment {
    pub fn url(self) -> &'static str {
        match self {
            Environment::Production => PRODUCTION_URL,
            Environment::Preproduction => PREPRODUCTION_URL,
        }
    }

    /// Detect from `CACHE_ENV`. Development counts as pre-production.
    pub fn from_env() -> Self {
        match std::env::var("CACHE_ENV")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "preproduction" | "development" => Environment::Preproduction,
            _ => Environment::Production,
        }
    }
}

/// What happens when close cannot complete before the fallback timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Force the closed state and report `CloseTimeout` as an error event.
    #[default]
    Report,
    /// As `Report`, then terminate the process with exit code 1.
    Exit,
}

/// Cache client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Service endpoint (http(s) or ws(s)).
    pub url: String,
    /// API key.
    pub key: String,
    /// Shared secret used to sign the key.
    #[serde(alias = "auth_pass")]
    pub secret: String,
    /// Namespace (db index) stamped on every command.
    pub namespace: i64,
    /// Time allowed for the first connection attempt to resolve.
    pub timeout_ms: u64,
    /// Interval of the keep-alive tick.
    pub keep_alive_interval_ms: u64,
    /// Base reconnect delay after a failed connection attempt.
    pub reconnect_base_delay_ms: u64,
    /// Maximum reconnect delay.
    pub reconnect_max_delay_ms: u64,
    /// How long to wait for the service after sending `disconnecting`.
    pub close_watchdog_ms: u64,
    /// Hard limit on a close that is waiting for a connect or a send.
    pub close_fallback_ms: u64,
    /// Never connect; every command fails with `Disabled`.
    pub disabled: bool,
    /// Shut down gracefully on SIGINT/SIGTERM and exit afterwards.
    pub intercept_signals: bool,
    pub shutdown_policy: ShutdownPolicy,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: Environment::default().url().to_string(),
            key: String::new(),
            secret: String::new(),
            namespace: 0,
            timeout_ms: 10_000,
            keep_alive_interval_ms: 60_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            close_watchdog_ms: 5_000,
            close_fallback_ms: 5_000,
            disabled: false,
            intercept_signals: false,
            shutdown_policy: ShutdownPolicy::Report,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl CacheConfig {
    /// Defaults for the detected environment, then environment overrides.
    pub fn new() -> Self {
        let mut config = Self {
            url: Environment::from_env().url().to_string(),
            ..Self::default()
        };
        config.load_from_env();
        config
    }

    /// Shorthand for the common key/secret case.
    pub fn with_credentials(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> CacheResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: CacheConfig = serde_json::from_str(&content)?;
        config.load_from_env();
        Ok(config)
    }

    /// Override fields from `CACHE_*` environment variables.
    pub fn load_from_env(&mut self) {
        if let Some(url) = env_value("CACHE_URL") {
            self.url = url;
        }
        if let Some(key) = env_value("CACHE_KEY") {
            self.key = key;
        }
        if let Some(secret) = env_value("CACHE_SECRET") {
            self.secret = secret;
        }
        if let Some(namespace) = env_value("CACHE_NAMESPACE").and_then(|v| v.parse().ok()) {
            self.namespace = namespace;
        }
        if let Some(level) = env_value("CACHE_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Reject configurations the client cannot start with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.key.is_empty() {
            return Err(CacheError::MissingKey);
        }
        if self.secret.is_empty() {
            return Err(CacheError::MissingSecret);
        }
        if self.timeout_ms == 0 {
            return Err(CacheError::Config("timeout_ms must be positive".to_string()));
        }
        if !self.disabled {
            self.parsed_url()?;
        }
        Ok(())
    }

    pub fn parsed_url(&self) -> CacheResult<Url> {
        Url::parse(&self.url).map_err(CacheError::from)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn close_watchdog(&self) -> Duration {
        Duration::from_millis(self.close_watchdog_ms)
    }

    pub fn close_fallback(&self) -> Duration {
        Duration::from_millis(self.close_fallback_ms)
    }

    /// Exponential backoff: `min(base * 2^(attempt-1), max)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
