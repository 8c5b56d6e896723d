//! Cache configuration: entry time-to-live and sweep cadence.
//!
//! Both knobs are fixed for the lifetime of a [`ResourceCache`](super::ResourceCache).
//! Values can be built in code, deserialized from JSON, or read from the
//! environment:
//!
//! | Variable                      | Field            | Default   |
//! |-------------------------------|------------------|-----------|
//! | `RESCACHE_TTL_MS`             | `ttl`            | 5000 ms   |
//! | `RESCACHE_SWEEP_INTERVAL_MS`  | `sweep_interval` | 5000 ms   |

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Default time-to-live of an unaccessed entry (5 s).
pub const DEFAULT_TTL: Duration = Duration::from_millis(5_000);

/// Default period between two expiration sweeps (5 s).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(5_000);

const TTL_ENV: &str = "RESCACHE_TTL_MS";
const SWEEP_INTERVAL_ENV: &str = "RESCACHE_SWEEP_INTERVAL_MS";

/// Errors produced while building a [`CacheConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sweep interval must be greater than zero")]
    ZeroSweepInterval,

    #[error("invalid value {value:?} for {var}: expected milliseconds")]
    Env { var: &'static str, value: String },

    #[error("invalid cache configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings for a [`ResourceCache`](super::ResourceCache).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rescache::cache::CacheConfig;
///
/// let config = CacheConfig::from_json(r#"{ "ttl_ms": 2000 }"#).unwrap();
/// assert_eq!(config.ttl, Duration::from_secs(2));
/// assert_eq!(config.sweep_interval, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an entry survives without being accessed.
    #[serde(rename = "ttl_ms", deserialize_with = "millis")]
    pub ttl: Duration,

    /// How often the background sweep looks for expired entries.
    #[serde(rename = "sweep_interval_ms", deserialize_with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with the given TTL and the default sweep interval.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Overrides the sweep interval.
    #[must_use]
    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Parses a JSON object with optional `ttl_ms` and `sweep_interval_ms` fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] on malformed input and
    /// [`ConfigError::ZeroSweepInterval`] if the result fails [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `RESCACHE_TTL_MS` and `RESCACHE_SWEEP_INTERVAL_MS`, falling back to
    /// defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a variable is set but is not a whole
    /// number of milliseconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(
            std::env::var(TTL_ENV).ok(),
            std::env::var(SWEEP_INTERVAL_ENV).ok(),
        )
    }

    fn from_vars(ttl: Option<String>, sweep_interval: Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            ttl: parse_millis(TTL_ENV, ttl)?.unwrap_or(DEFAULT_TTL),
            sweep_interval: parse_millis(SWEEP_INTERVAL_ENV, sweep_interval)?
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can drive a sweep timer.
    ///
    /// A zero TTL is allowed (entries become eligible at the next sweep); a zero
    /// sweep interval is not.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }
}

/// Parses the value of `var` as whole milliseconds. `None` means unset.
fn parse_millis(var: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.trim().parse::<u64>() {
        Ok(ms) => Ok(Some(Duration::from_millis(ms))),
        Err(_) => Err(ConfigError::Env { var, value }),
    }
}

pub(crate) fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
