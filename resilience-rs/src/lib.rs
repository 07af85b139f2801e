//! # Resilience Layer
//!
//! Error tracking, retry and fallback orchestration, rate limiting and
//! health aggregation for the travel agent's request workers.
//!
//! ## Features
//!
//! - Error taxonomy with component tags, severities and traceable error ids
//! - Bounded recent-error ring and 24-hour per-component trends
//! - Retries with capped exponential backoff and a single fallback
//! - Fixed-window rate limits kept in a shared store, failing open
//! - Health status and error dashboard derived from recent counts
//!

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

pub mod clock;
pub mod degraded;
pub mod fallback;
pub mod health;
pub mod logging;
pub mod rate_limit;
pub mod retry;
pub mod sanitization;
pub mod settings;
pub mod store;
pub mod taxonomy;
pub mod tracker;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use fallback::{Call, FallbackOrchestrator, FallbackResult};
pub use health::{DashboardSnapshot, HealthAggregator, HealthCheck, HealthStatus, StatusView};
pub use logging::{init_logging, LoggingConfig};
pub use rate_limit::{Decision, RateLimitInfo, RateLimitRule, RateLimiter, Scope};
pub use retry::{RetryConfig, RetryPolicy};
pub use sanitization::{sanitize_message, UserFacingError};
pub use settings::ResilienceConfig;
pub use store::{MemoryStore, RedisStore, SharedStore, StoreError};
pub use taxonomy::{classify, Component, ErrorId, Severity};
pub use tracker::{ErrorRecord, ErrorTracker};
pub use types::{Error, ErrorKind, Result};

/// Every part of the layer, wired to one store and one tracker
#[derive(Debug, Clone)]
pub struct ResilienceLayer {
    config: ResilienceConfig,
    store: Arc<dyn SharedStore>,
    tracker: Arc<ErrorTracker>,
    limiter: Arc<RateLimiter>,
    orchestrator: Arc<FallbackOrchestrator>,
    health: Arc<HealthAggregator>,
}

impl ResilienceLayer {
    /// Connects the configured store and builds the layer.
    ///
    /// An unreachable Redis falls back to the in-process store.
    pub async fn from_config(config: ResilienceConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let timeout = Duration::from_millis(config.store.timeout_ms);

        let store: Arc<dyn SharedStore> = match config.store.redis_url.as_deref() {
            Some(url) => match RedisStore::connect(url, timeout).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, using in-process store");
                    Arc::new(MemoryStore::with_clock(clock.clone()))
                }
            },
            None => Arc::new(MemoryStore::with_clock(clock.clone())),
        };

        Self::with_parts(config, store, clock)
    }

    /// Builds the layer over an existing store and clock
    pub fn with_parts(
        config: ResilienceConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut tracker = ErrorTracker::new(config.tracker.clone()).with_clock(clock.clone());
        // Only a shared backend is mirrored
        if store.backend() != "memory" {
            tracker = tracker.with_store(store.clone());
        }
        let tracker = Arc::new(tracker);

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            store.clone(),
            tracker.clone(),
            clock,
        ));
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            tracker.clone(),
            RetryPolicy::new("default", config.retry.clone()),
        ));
        let health = Arc::new(HealthAggregator::new(tracker.clone(), config.health.clone()));

        info!(
            store = store.backend(),
            rules = limiter.rules().len(),
            "Resilience layer ready"
        );

        Ok(Self {
            config,
            store,
            tracker,
            limiter,
            orchestrator,
            health,
        })
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.orchestrator
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    /// Records a validation failure as a WARNING and returns the scrubbed
    /// feedback for the user
    pub async fn reject_invalid(&self, error: &Error) -> UserFacingError {
        let component = error.component.unwrap_or(Component::Validation);
        let record = self
            .tracker
            .record_error_as(error, component, Severity::Warning)
            .await;
        UserFacingError::validation(&error.message, &record.id)
    }

    /// Records any other failure under its classified severity and returns
    /// a generic message carrying only the error id
    pub async fn report(&self, error: &Error) -> UserFacingError {
        let record = self.tracker.record_error(error).await;
        UserFacingError::from_record(&record)
    }
}

/// Initializes logging from the given configuration
pub fn init(config: &ResilienceConfig) -> Result<()> {
    init_logging(&config.logging)
}

// Recovers the guard from a poisoned mutex
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
