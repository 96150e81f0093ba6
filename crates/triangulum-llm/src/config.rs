//! Secure configuration loading with memory-safe environment variable handling.
//!
//! Analyzer roles that need an LLM (semantic, contextual) share one client
//! built from this configuration; the API key never leaves `Secret` storage
//! except for the one `Authorization` header built per request.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, Secret};
use tracing::{debug, warn};

use crate::DEFAULT_RATE_LIMIT;

/// Configuration for the LLM client with secure secret handling.
#[derive(Debug, Clone)]
pub struct Config {
    /// API base URL, e.g. `https://api.anthropic.com/v1/messages`.
    base_url: String,
    /// Model identifier sent with each request.
    model: String,
    /// API key, held as a `Secret` for its whole lifetime.
    api_key: Secret<String>,
    /// Requests-per-minute budget enforced client-side.
    rate_limit: u32,
    /// Per-request timeout.
    timeout_seconds: u64,
    /// Whether to enable debug logging (careful with secrets!).
    debug_mode: bool,
}

/// Secure environment variable loader with automatic cleanup.
pub struct EnvLoader {
    /// Cached environment variables (zeroized on drop via `Secret`'s own `Drop`).
    env_cache: HashMap<String, Secret<String>>,
}

impl EnvLoader {
    /// Create a new environment loader.
    ///
    /// # Security
    /// This function loads all relevant environment variables into a secure
    /// cache that will be automatically zeroized when dropped.
    pub fn new() -> Result<Self> {
        let mut env_cache = HashMap::new();

        let env_vars = [
            "TRIANGULUM_LLM_API_KEY",
            "TRIANGULUM_LLM_BASE_URL",
            "TRIANGULUM_LLM_MODEL",
            "TRIANGULUM_LLM_RATE_LIMIT",
            "TRIANGULUM_LLM_TIMEOUT",
            "TRIANGULUM_LLM_DEBUG",
        ];

        for var_name in &env_vars {
            if let Ok(value) = env::var(var_name) {
                env_cache.insert(var_name.to_string(), Secret::new(value));
            }
        }

        debug!("loaded {} environment variables into secure cache", env_cache.len());
        Ok(Self { env_cache })
    }

    /// Get a required environment variable securely.
    pub fn get_required(&self, key: &str) -> Result<&Secret<String>> {
        self.env_cache
            .get(key)
            .with_context(|| format!("required environment variable {} not found", key))
    }

    /// Get an optional environment variable securely.
    pub fn get_optional(&self, key: &str) -> Option<&Secret<String>> {
        self.env_cache.get(key)
    }

    /// Get a non-sensitive configuration value.
    pub fn get_public(&self, key: &str) -> Option<String> {
        self.env_cache.get(key).map(|secret| secret.expose_secret().clone())
    }

    /// Parse a numeric environment variable with a default.
    pub fn get_numeric<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr + Copy,
        T::Err: std::fmt::Display,
    {
        self.get_public(key)
            .and_then(|value| {
                value
                    .parse()
                    .map_err(|e| {
                        warn!("failed to parse {} as numeric: {}", key, e);
                        e
                    })
                    .ok()
            })
            .unwrap_or(default)
    }

    /// Parse a boolean environment variable with a default.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_public(key)
            .map(|value| matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(default)
    }
}

impl Drop for EnvLoader {
    fn drop(&mut self) {
        self.env_cache.clear();
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `TRIANGULUM_LLM_API_KEY` - required
    /// - `TRIANGULUM_LLM_BASE_URL` - required
    /// - `TRIANGULUM_LLM_MODEL` - default: `"default"`
    /// - `TRIANGULUM_LLM_RATE_LIMIT` - requests per minute, default: 60
    /// - `TRIANGULUM_LLM_TIMEOUT` - seconds, default: 30
    /// - `TRIANGULUM_LLM_DEBUG` - `"true"`/`"false"`, default: false
    pub fn from_env() -> Result<Self> {
        let env_loader = EnvLoader::new().context("failed to create secure environment loader")?;
        Self::from_env_loader(env_loader)
    }

    /// Load configuration from an environment loader, for dependency injection in tests.
    pub fn from_env_loader(env_loader: EnvLoader) -> Result<Self> {
        let api_key = env_loader
            .get_required("TRIANGULUM_LLM_API_KEY")
            .context("TRIANGULUM_LLM_API_KEY required")?
            .clone();
        let base_url = env_loader
            .get_required("TRIANGULUM_LLM_BASE_URL")
            .context("TRIANGULUM_LLM_BASE_URL required")?
            .expose_secret()
            .clone();
        let model = env_loader.get_public("TRIANGULUM_LLM_MODEL").unwrap_or_else(|| "default".to_string());
        let rate_limit = env_loader.get_numeric("TRIANGULUM_LLM_RATE_LIMIT", DEFAULT_RATE_LIMIT);
        let timeout_seconds = env_loader.get_numeric("TRIANGULUM_LLM_TIMEOUT", 30u64);
        let debug_mode = env_loader.get_bool("TRIANGULUM_LLM_DEBUG", false);

        if debug_mode {
            warn!("debug mode enabled - be careful with sensitive data in logs!");
        }

        Ok(Self {
            base_url,
            model,
            api_key,
            rate_limit,
            timeout_seconds,
            debug_mode,
        })
    }

    /// Build a config directly, for callers that already hold a key (e.g. from a secret store).
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Secret<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            rate_limit: DEFAULT_RATE_LIMIT,
            timeout_seconds: 30,
            debug_mode: false,
        }
    }

    /// The configured API base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The configured model identifier.
    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// The API key, exposed only to the caller constructing an auth header.
    pub fn api_key(&self) -> &Secret<String> {
        &self.api_key
    }

    /// The configured rate limit, in requests per minute.
    pub fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    /// The configured per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Whether debug mode is enabled.
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn env_loader_clears_cache_on_drop() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("TRIANGULUM_LLM_TEST_SECRET", "sensitive_value");
        {
            let loader = EnvLoader::new().unwrap();
            assert!(loader.get_optional("TRIANGULUM_LLM_TEST_SECRET").is_some());
        }
        env::remove_var("TRIANGULUM_LLM_TEST_SECRET");
    }

    #[test]
    fn from_env_loader_fills_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("TRIANGULUM_LLM_API_KEY", "test-key");
        env::set_var("TRIANGULUM_LLM_BASE_URL", "https://example.test/v1");
        env::remove_var("TRIANGULUM_LLM_MODEL");
        env::remove_var("TRIANGULUM_LLM_RATE_LIMIT");

        let loader = EnvLoader::new().unwrap();
        let config = Config::from_env_loader(loader).unwrap();
        assert_eq!(config.model_name(), "default");
        assert_eq!(config.rate_limit(), DEFAULT_RATE_LIMIT);
        assert_eq!(config.timeout(), Duration::from_secs(30));

        env::remove_var("TRIANGULUM_LLM_API_KEY");
        env::remove_var("TRIANGULUM_LLM_BASE_URL");
    }

    #[test]
    fn from_env_loader_requires_api_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("TRIANGULUM_LLM_API_KEY");
        env::set_var("TRIANGULUM_LLM_BASE_URL", "https://example.test/v1");
        let loader = EnvLoader::new().unwrap();
        assert!(Config::from_env_loader(loader).is_err());
        env::remove_var("TRIANGULUM_LLM_BASE_URL");
    }
}
