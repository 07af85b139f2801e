//! # Retry Policy
//!
//! Exponential backoff with a cap and additive jitter. The attempt loop
//! itself lives in the fallback orchestrator; this module decides how many
//! attempts an operation gets and how long to wait between them.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{Error, ErrorKind, Result};

/// Configuration for a retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for the exponential part, in milliseconds
    pub max_delay_ms: u64,
    /// Jitter added on top of the capped delay, as a fraction of it
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::new(
                ErrorKind::Configuration,
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::new(
                ErrorKind::Configuration,
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(Error::new(
                ErrorKind::Configuration,
                "retry.jitter_fraction must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// A named retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
    name: String,
}

impl RetryPolicy {
    /// Creates a new retry policy with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: RetryConfig) -> Self {
        Self {
            config,
            name: name.into(),
        }
    }

    /// Single attempt, no backoff
    pub fn never() -> Self {
        Self::new(
            "never",
            RetryConfig {
                max_attempts: 1,
                ..Default::default()
            },
        )
    }

    /// Policy for LLM completions: slow upstream, generous spacing
    pub fn llm() -> Self {
        Self::new(
            "llm",
            RetryConfig {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 8_000,
                jitter_fraction: 0.2,
            },
        )
    }

    /// Policy for flight and hotel search providers
    pub fn search() -> Self {
        Self::new(
            "search",
            RetryConfig {
                max_attempts: 3,
                base_delay_ms: 300,
                max_delay_ms: 5_000,
                jitter_fraction: 0.2,
            },
        )
    }

    /// Policy for the shared store
    pub fn store() -> Self {
        Self::new(
            "store",
            RetryConfig {
                max_attempts: 3,
                base_delay_ms: 50,
                max_delay_ms: 2_000,
                jitter_fraction: 0.1,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempts including the first, never less than one
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Whether another attempt should follow failed attempt number `attempt`
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        attempt < self.max_attempts() && error.is_transient()
    }

    /// `min(max_delay, base_delay * 2^(attempt-1))` for attempt >= 1
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.base_delay_ms);
        let max = Duration::from_millis(self.config.max_delay_ms);
        let exponent = attempt.saturating_sub(1).min(31);
        base.saturating_mul(1u32 << exponent).min(max)
    }

    /// Upper bound of the jitter added after attempt `attempt`
    pub fn jitter_bound(&self, attempt: u32) -> Duration {
        let fraction = self.config.jitter_fraction;
        // NaN survives clamp and mul_f64 panics on it
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.capped_delay(attempt).mul_f64(fraction)
    }

    /// Delay to wait after failed attempt `attempt` (1-based): the capped
    /// exponential delay plus jitter drawn uniformly from
    /// `[0, delay * jitter_fraction]`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let delay = self.capped_delay(attempt);
        let bound = self.jitter_bound(attempt);
        if bound.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=bound);
        delay + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("default", RetryConfig::default())
    }
}
