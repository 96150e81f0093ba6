//! Declarative configuration for the pool manager: per-class concurrency bounds,
//! circuit-breaker thresholds, rate limits and scaler tuning.
//!
//! Durations and percentages are frequently authored as human strings (`"2m"`,
//! `"50%"`) in configuration files; the parsing helpers here turn those into the
//! numeric types the rest of the crate works with.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::scaler::ScalerConfig;

/// The six worker classes named in the coordination contract.
pub const KNOWN_CLASSES: &[&str] = &[
    "file-analysis",
    "relationship-resolution",
    "validation",
    "directory-aggregation",
    "global-relationship-analysis",
    "graph-ingestion",
];

/// Global pool-wide settings plus one [`ClassConfig`] per worker class.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on in-flight jobs across all classes (default 100).
    pub global_cap: usize,
    /// Per-class configuration, keyed by class name.
    pub classes: HashMap<String, ClassConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let classes = KNOWN_CLASSES
            .iter()
            .map(|&name| (name.to_string(), ClassConfig::default()))
            .collect();
        Self {
            global_cap: 100,
            classes,
        }
    }
}

impl PoolConfig {
    /// Look up a class's configuration, falling back to defaults for unknown classes.
    pub fn class(&self, name: &str) -> ClassConfig {
        self.classes.get(name).cloned().unwrap_or_default()
    }
}

/// Concurrency bounds, breaker, rate limit and scaler settings for one worker class.
#[derive(Debug, Clone)]
pub struct ClassConfig {
    /// Minimum concurrency the scaler will not go below.
    pub min_concurrency: usize,
    /// Maximum concurrency the scaler will not exceed.
    pub max_concurrency: usize,
    /// Starting concurrency when the pool manager is constructed.
    pub initial_concurrency: usize,
    /// Per-class job timeout (managed worker runtime default: 5 minutes).
    pub job_timeout: Duration,
    /// Circuit breaker tuning for this class.
    pub breaker: CircuitBreakerConfig,
    /// Rate limit for this class; `None` disables rate limiting.
    pub rate_limit: Option<RateLimitConfig>,
    /// Sustained-load scaler tuning for this class.
    pub scaler: ScalerConfig,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 8,
            initial_concurrency: 2,
            job_timeout: Duration::from_secs(5 * 60),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: None,
            scaler: ScalerConfig::default(),
        }
    }
}

/// Parse a human-authored duration string (`"5m"`, `"30s"`, `"1500ms"`, or a raw
/// number of seconds) into a [`Duration`].
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let lower = raw.trim().to_lowercase();
    if let Some(stripped) = lower.strip_suffix("ms") {
        return Ok(Duration::from_millis(stripped.parse()?));
    }
    if let Some(stripped) = lower.strip_suffix('h') {
        return Ok(Duration::from_secs(stripped.parse::<u64>()? * 3600));
    }
    if let Some(stripped) = lower.strip_suffix('m') {
        return Ok(Duration::from_secs(stripped.parse::<u64>()? * 60));
    }
    if let Some(stripped) = lower.strip_suffix('s') {
        return Ok(Duration::from_secs(stripped.parse()?));
    }
    Ok(Duration::from_secs(lower.parse()?))
}

/// Parse a percentage string (`"75%"`, `"0.75"`, or `"75"`) into a `0.0..=1.0` fraction.
pub fn parse_fraction(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    let value: f64 = if let Some(stripped) = trimmed.strip_suffix('%') {
        stripped.parse::<f64>()? / 100.0
    } else {
        trimmed.parse()?
    };
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("fraction out of range [0, 1]: {raw}"));
    }
    Ok(value)
}
