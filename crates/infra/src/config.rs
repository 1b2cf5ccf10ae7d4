//! Relay configuration loading and representation.
//!
//! The recognized surface mirrors what deployments already set:
//!
//! ```json
//! {
//!   "retryInterval": 60000,
//!   "circuit": { "timeout": 3000, "threshold": 50, "reset": 30000 }
//! }
//! ```
//!
//! All durations are milliseconds. Anything omitted takes its default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Env var pointing at a JSON config file.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";

const DEFAULT_RETRY_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SWEEP_CONCURRENCY: usize = 8;
const DEFAULT_SCHEMA_PREFIX: &str = "tenant_";

const DEFAULT_CIRCUIT_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CIRCUIT_THRESHOLD: u8 = 50;
const DEFAULT_CIRCUIT_RESET_MS: u64 = 30_000;
const DEFAULT_ROLLING_WINDOW_MS: u64 = 10_000;
const DEFAULT_ROLLING_BUCKETS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Time between retry sweeps of one tenant's queue.
    #[serde(with = "millis")]
    pub retry_interval: Duration,
    /// Maximum redeliveries in flight during a single sweep.
    pub sweep_concurrency: usize,
    /// Prefix of the per-tenant Postgres schema holding pending triggers.
    pub schema_prefix: String,
    pub circuit: CircuitConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            sweep_concurrency: DEFAULT_SWEEP_CONCURRENCY,
            schema_prefix: DEFAULT_SCHEMA_PREFIX.to_string(),
            circuit: CircuitConfig::default(),
        }
    }
}

/// Circuit breaker options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitConfig {
    /// A call running longer than this counts as failed.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Failure percentage (1..=100) within the rolling window that trips the breaker.
    pub threshold: u8,
    /// How long the breaker stays open before letting a probe through.
    #[serde(with = "millis")]
    pub reset: Duration,
    /// Length of the rolling statistics window.
    #[serde(with = "millis")]
    pub rolling_window: Duration,
    /// Number of buckets the rolling window is split into.
    pub rolling_buckets: u32,
    /// Minimum calls in the window before the breaker may trip.
    pub volume_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_CIRCUIT_TIMEOUT_MS),
            threshold: DEFAULT_CIRCUIT_THRESHOLD,
            reset: Duration::from_millis(DEFAULT_CIRCUIT_RESET_MS),
            rolling_window: Duration::from_millis(DEFAULT_ROLLING_WINDOW_MS),
            rolling_buckets: DEFAULT_ROLLING_BUCKETS,
            volume_threshold: 0,
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("circuit.timeout", "must be > 0"));
        }
        if !(1..=100).contains(&self.threshold) {
            return Err(ConfigError::invalid(
                "circuit.threshold",
                format!("{} is not a percentage in 1..=100", self.threshold),
            ));
        }
        if self.reset.is_zero() {
            return Err(ConfigError::invalid("circuit.reset", "must be > 0"));
        }
        if self.rolling_buckets == 0 {
            return Err(ConfigError::invalid("circuit.rollingBuckets", "must be > 0"));
        }
        if self.rolling_window < Duration::from_millis(u64::from(self.rolling_buckets)) {
            return Err(ConfigError::invalid(
                "circuit.rollingWindow",
                "must be at least one millisecond per bucket",
            ));
        }
        Ok(())
    }
}

impl RelayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Load from `RELAY_CONFIG` (if set), then apply per-key env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `RELAY_*` overrides using the given lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_override::<u64>(&lookup, "RELAY_RETRY_INTERVAL_MS", "retryInterval")? {
            self.retry_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_override::<usize>(&lookup, "RELAY_SWEEP_CONCURRENCY", "sweepConcurrency")? {
            self.sweep_concurrency = n;
        }
        if let Some(prefix) = lookup("RELAY_SCHEMA_PREFIX") {
            self.schema_prefix = prefix;
        }
        if let Some(ms) = parse_override::<u64>(&lookup, "RELAY_CIRCUIT_TIMEOUT_MS", "circuit.timeout")? {
            self.circuit.timeout = Duration::from_millis(ms);
        }
        if let Some(pct) = parse_override::<u8>(&lookup, "RELAY_CIRCUIT_THRESHOLD", "circuit.threshold")? {
            self.circuit.threshold = pct;
        }
        if let Some(ms) = parse_override::<u64>(&lookup, "RELAY_CIRCUIT_RESET_MS", "circuit.reset")? {
            self.circuit.reset = Duration::from_millis(ms);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval.is_zero() {
            return Err(ConfigError::invalid("retryInterval", "must be > 0"));
        }
        if self.sweep_concurrency == 0 {
            return Err(ConfigError::invalid("sweepConcurrency", "must be > 0"));
        }
        let prefix_ok = !self.schema_prefix.is_empty()
            && self
                .schema_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !prefix_ok {
            return Err(ConfigError::invalid(
                "schemaPrefix",
                "only ASCII letters, digits and '_' are allowed",
            ));
        }
        self.circuit.validate()
    }
}

fn parse_override<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    env_key: &str,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(env_key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, format!("{env_key}={raw}: {e}"))),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
