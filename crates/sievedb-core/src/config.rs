//! `SieveDB` Configuration Module
//!
//! Provides configuration file support via `sievedb.toml`, environment variables,
//! and programmatic construction.
//!
//! # Priority (highest to lowest)
//!
//! 1. Environment variables (`SIEVEDB_*`, e.g. `SIEVEDB_CACHE__ENABLED=false`)
//! 2. Configuration file (`sievedb.toml`)
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },
}

/// Result cache configuration section.
///
/// Consumed once when a [`crate::cache::CacheEngine`] is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. A disabled engine computes every formula directly.
    pub enabled: bool,
    /// Maximum number of adepts waiting in the anteroom.
    pub anteroom_record_count: usize,
    /// Memory budget of promoted cache records in bytes.
    pub cache_size_in_bytes: u64,
    /// Interval of the background reevaluation cycle in milliseconds.
    pub reevaluation_interval_ms: u64,
    /// Minimal estimated cost a formula must have to consult the cache.
    pub minimal_complexity_threshold: u64,
    /// Minimal number of usages (hits + misses) before an adept is promoted.
    pub minimal_usage_threshold: u64,
    /// Score an adept must reach to be promoted.
    pub promotion_score_threshold: f64,
    /// Score below which a cached record cools down.
    pub cooldown_score_threshold: f64,
    /// Number of cycles a record may stay in cooldown before eviction.
    pub cooldown_cycles: u32,
    /// Idle time in milliseconds after which an adept is discarded.
    pub adept_ttl_ms: u64,
    /// Largest record in bytes that is ever admitted.
    pub max_record_size_in_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anteroom_record_count: 100_000,
            cache_size_in_bytes: 104_857_600, // 100 MB
            reevaluation_interval_ms: 60_000,
            minimal_complexity_threshold: 10_000,
            minimal_usage_threshold: 2,
            promotion_score_threshold: 1.0,
            cooldown_score_threshold: 0.5,
            cooldown_cycles: 1,
            adept_ttl_ms: 300_000,
            max_record_size_in_bytes: 1_048_576, // 1 MB
        }
    }
}

impl CacheConfig {
    /// Returns the reevaluation interval as a [`Duration`].
    #[must_use]
    pub fn reevaluation_interval(&self) -> Duration {
        Duration::from_millis(self.reevaluation_interval_ms)
    }

    /// Returns the adept time-to-live as a [`Duration`].
    #[must_use]
    pub fn adept_ttl(&self) -> Duration {
        Duration::from_millis(self.adept_ttl_ms)
    }

    /// Validates the cache section.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.anteroom_record_count == 0 {
            return Err(invalid(
                "cache.anteroom_record_count",
                "value must be greater than 0".to_string(),
            ));
        }

        if self.cache_size_in_bytes == 0 {
            return Err(invalid(
                "cache.cache_size_in_bytes",
                "value must be greater than 0".to_string(),
            ));
        }

        if self.reevaluation_interval_ms < 10 {
            return Err(invalid(
                "cache.reevaluation_interval_ms",
                format!("value {} must be >= 10", self.reevaluation_interval_ms),
            ));
        }

        for (key, value) in [
            (
                "cache.promotion_score_threshold",
                self.promotion_score_threshold,
            ),
            (
                "cache.cooldown_score_threshold",
                self.cooldown_score_threshold,
            ),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(
                    key,
                    format!("value {value} must be a finite non-negative number"),
                ));
            }
        }

        if self.cooldown_score_threshold > self.promotion_score_threshold {
            return Err(invalid(
                "cache.cooldown_score_threshold",
                format!(
                    "value {} must not exceed promotion_score_threshold {}",
                    self.cooldown_score_threshold, self.promotion_score_threshold
                ),
            ));
        }

        if self.max_record_size_in_bytes > self.cache_size_in_bytes {
            return Err(invalid(
                "cache.max_record_size_in_bytes",
                format!(
                    "value {} must not exceed cache_size_in_bytes {}",
                    self.max_record_size_in_bytes, self.cache_size_in_bytes
                ),
            ));
        }

        Ok(())
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    }
}

/// Main `SieveDB` configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SieveConfig {
    /// Result cache configuration.
    pub cache: CacheConfig,
}

impl SieveConfig {
    /// Loads configuration from default sources.
    ///
    /// Priority: defaults < file < environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("sievedb.toml")
    }

    /// Loads configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        // Nested keys are separated by a double underscore so that field names
        // containing `_` survive, e.g. `SIEVEDB_CACHE__COOLDOWN_CYCLES=3`.
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SIEVEDB_").split("__"));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Creates a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml_str));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
