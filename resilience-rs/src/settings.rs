//! # Settings
//!
//! Layered configuration: built-in defaults, then an optional file, then
//! `RESILIENCE__SECTION__KEY` environment variables (a `.env` file is
//! read first if present).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::health::HealthConfig;
use crate::logging::LoggingConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::tracker::TrackerConfig;
use crate::types::{Error, ErrorKind, Result};

pub const ENV_PREFIX: &str = "RESILIENCE";

/// Shared store connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://` URL; the in-process store is used when absent
    pub redis_url: Option<String>,
    /// Upper bound for any single store call, in milliseconds
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_ms: 250,
        }
    }
}

/// Root configuration of the resilience layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub tracker: TrackerConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub health: HealthConfig,
}

impl ResilienceConfig {
    /// Loads defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = Self::try_from(builder.build()?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(Error::new(
                ErrorKind::Configuration,
                "store.timeout_ms must be positive",
            ));
        }
        if self.tracker.capacity == 0 {
            return Err(Error::new(
                ErrorKind::Configuration,
                "tracker.capacity must be positive",
            ));
        }
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.health.validate()?;
        Ok(())
    }
}

impl TryFrom<config::Config> for ResilienceConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        cfg.try_deserialize()
    }
}
