//! # Health Aggregation
//!
//! Derives per-component and system health from the tracker's hourly
//! counters and assembles the error dashboard. Status is recomputed from
//! counts on every read; the only stored state is the per-component reset
//! baseline.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lock;
use crate::taxonomy::{Component, Severity};
use crate::tracker::{ErrorRecord, ErrorTracker, TREND_HOURS};
use crate::types::{Error, ErrorKind, Result};

/// Ordered health: healthy < warning < error < critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Error => "error",
            HealthStatus::Critical => "critical",
        }
    }

    /// HTTP status for the health endpoint: only critical is unavailable
    pub fn http_status(&self) -> u16 {
        match self {
            HealthStatus::Critical => 503,
            _ => 200,
        }
    }
}

/// Thresholds and window for the status rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Hours of counters (current hour included) a status looks at
    pub window_hours: u32,
    /// WARNING records needed for `warning`
    pub warning_threshold: u64,
    /// ERROR records needed for `error`
    pub error_threshold: u64,
    /// ERROR records that escalate to `critical`
    pub critical_error_threshold: u64,
    /// Recent records shown on the dashboard
    pub recent_errors_limit: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_hours: 1,
            warning_threshold: 3,
            error_threshold: 1,
            critical_error_threshold: 10,
            recent_errors_limit: 10,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_hours == 0 || self.window_hours as usize > TREND_HOURS {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!("health.window_hours must be within 1..={}", TREND_HOURS),
            ));
        }
        if self.error_threshold == 0
            || self.warning_threshold == 0
            || self.critical_error_threshold < self.error_threshold
        {
            return Err(Error::new(
                ErrorKind::Configuration,
                "health thresholds must be positive and critical_error_threshold >= error_threshold",
            ));
        }
        Ok(())
    }

    /// Status for per-severity counts within the window
    pub fn status_for(&self, counts: &[u64; 5]) -> HealthStatus {
        let warnings = counts[Severity::Warning.index()];
        let errors = counts[Severity::Error.index()];
        let critical = counts[Severity::Critical.index()];

        if critical > 0 || errors >= self.critical_error_threshold {
            HealthStatus::Critical
        } else if errors >= self.error_threshold {
            HealthStatus::Error
        } else if warnings >= self.warning_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health of one component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub warnings: u64,
    pub errors: u64,
    pub critical: u64,
}

/// Status block of the dashboard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub system_status: HealthStatus,
    pub component_status: BTreeMap<Component, HealthStatus>,
    pub last_updated: DateTime<Utc>,
}

/// Everything the error dashboard shows
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub status: StatusView,
    /// 24 hourly counts per component, oldest first
    pub trends: BTreeMap<Component, Vec<u64>>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Body of the health check endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub components: BTreeMap<Component, HealthStatus>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    hour: i64,
    counts: [u64; 5],
}

/// Reads health out of an [`ErrorTracker`]
#[derive(Debug)]
pub struct HealthAggregator {
    tracker: Arc<ErrorTracker>,
    config: HealthConfig,
    baselines: Mutex<HashMap<Component, Baseline>>,
}

impl HealthAggregator {
    pub fn new(tracker: Arc<ErrorTracker>, config: HealthConfig) -> Self {
        Self {
            tracker,
            config,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Counts inside the window, minus anything recorded before a reset
    fn window_counts(&self, component: Component) -> [u64; 5] {
        let baseline = lock(&self.baselines).get(&component).copied();
        let mut total = [0u64; 5];

        for bucket in self
            .tracker
            .hourly_counts(component, self.config.window_hours)
        {
            let mut counts = bucket.counts;
            if let Some(baseline) = baseline {
                if bucket.hour < baseline.hour {
                    continue;
                }
                if bucket.hour == baseline.hour {
                    for (count, seen) in counts.iter_mut().zip(baseline.counts) {
                        *count = count.saturating_sub(seen);
                    }
                }
            }
            for (sum, count) in total.iter_mut().zip(counts) {
                *sum += count;
            }
        }
        total
    }

    pub fn component_health(&self, component: Component) -> ComponentHealth {
        let counts = self.window_counts(component);
        ComponentHealth {
            status: self.config.status_for(&counts),
            warnings: counts[Severity::Warning.index()],
            errors: counts[Severity::Error.index()],
            critical: counts[Severity::Critical.index()],
        }
    }

    pub fn component_status(&self, component: Component) -> HealthStatus {
        self.component_health(component).status
    }

    fn statuses(&self) -> BTreeMap<Component, HealthStatus> {
        Component::ALL
            .iter()
            .map(|component| (*component, self.component_status(*component)))
            .collect()
    }

    /// Worst component status, `healthy` when nothing is wrong
    pub fn system_status(&self) -> HealthStatus {
        let status = Component::ALL
            .iter()
            .map(|component| self.component_status(*component))
            .max()
            .unwrap_or(HealthStatus::Healthy);
        gauge!("resilience.health.system_status", status as u8 as f64);
        status
    }

    pub async fn dashboard(&self) -> DashboardSnapshot {
        let component_status = self.statuses();
        let system_status = component_status
            .values()
            .copied()
            .max()
            .unwrap_or(HealthStatus::Healthy);

        DashboardSnapshot {
            status: StatusView {
                system_status,
                component_status,
                last_updated: self.tracker.clock().now(),
            },
            trends: self.tracker.trends(),
            recent_errors: self.tracker.recent(self.config.recent_errors_limit).await,
        }
    }

    /// Health check body plus the HTTP status to serve it with
    pub fn health_check(&self) -> (HealthCheck, u16) {
        let components = self.statuses();
        let status = components
            .values()
            .copied()
            .max()
            .unwrap_or(HealthStatus::Healthy);

        let check = HealthCheck {
            status,
            components,
            timestamp: self.tracker.clock().now(),
        };
        (check, status.http_status())
    }

    /// Forgets everything recorded for `component` so far.
    ///
    /// The tracker's trends and recent list are untouched; only the
    /// status computation ignores counts at or before this moment.
    pub fn reset(&self, component: Component) {
        let hour = self.tracker.current_hour();
        let counts = self
            .tracker
            .hourly_counts(component, 1)
            .last()
            .map(|bucket| bucket.counts)
            .unwrap_or([0; 5]);

        lock(&self.baselines).insert(component, Baseline { hour, counts });
        info!(component = %component, "Component health reset");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::tracker::TrackerConfig;

    fn setup() -> (Arc<ManualClock>, Arc<ErrorTracker>, HealthAggregator) {
        let clock = Arc::new(ManualClock::fixed());
        let tracker = Arc::new(ErrorTracker::new(TrackerConfig::default()).with_clock(clock.clone()));
        let health = HealthAggregator::new(tracker.clone(), HealthConfig::default());
        (clock, tracker, health)
    }

    #[test]
    fn test_status_rules() {
        let config = HealthConfig::default();
        let counts = |w: u64, e: u64, c: u64| [0, 0, w, e, c];

        assert_eq!(config.status_for(&counts(0, 0, 0)), HealthStatus::Healthy);
        assert_eq!(config.status_for(&counts(2, 0, 0)), HealthStatus::Healthy);
        assert_eq!(config.status_for(&counts(3, 0, 0)), HealthStatus::Warning);
        assert_eq!(config.status_for(&counts(0, 1, 0)), HealthStatus::Error);
        assert_eq!(config.status_for(&counts(0, 9, 0)), HealthStatus::Error);
        assert_eq!(config.status_for(&counts(0, 10, 0)), HealthStatus::Critical);
        assert_eq!(config.status_for(&counts(0, 0, 1)), HealthStatus::Critical);
        assert_eq!(config.status_for(&[50, 50, 0, 0, 0]), HealthStatus::Healthy);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(HealthStatus::Healthy.http_status(), 200);
        assert_eq!(HealthStatus::Warning.http_status(), 200);
        assert_eq!(HealthStatus::Error.http_status(), 200);
        assert_eq!(HealthStatus::Critical.http_status(), 503);
    }

    #[tokio::test]
    async fn test_system_status_is_worst_component() {
        let (_clock, tracker, health) = setup();
        assert_eq!(health.system_status(), HealthStatus::Healthy);

        tracker.record(Component::Search, Severity::Error, "503", vec![]).await;
        assert_eq!(health.component_status(Component::Search), HealthStatus::Error);
        assert_eq!(health.system_status(), HealthStatus::Error);

        tracker.record(Component::Llm, Severity::Critical, "down", vec![]).await;
        assert_eq!(health.system_status(), HealthStatus::Critical);

        let (check, status) = health.health_check();
        assert_eq!(status, 503);
        assert_eq!(check.components[&Component::Search], HealthStatus::Error);
    }

    #[tokio::test]
    async fn test_status_decays_outside_window() {
        let (clock, tracker, health) = setup();

        tracker.record(Component::Store, Severity::Critical, "down", vec![]).await;
        assert_eq!(health.component_status(Component::Store), HealthStatus::Critical);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(health.component_status(Component::Store), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_reset_ignores_earlier_counts() {
        let (clock, tracker, health) = setup();

        for _ in 0..4 {
            tracker.record(Component::Llm, Severity::Error, "timeout", vec![]).await;
        }
        assert_eq!(health.component_status(Component::Llm), HealthStatus::Error);

        health.reset(Component::Llm);
        assert_eq!(health.component_status(Component::Llm), HealthStatus::Healthy);
        assert_eq!(tracker.trends()[&Component::Llm][TREND_HOURS - 1], 4);

        clock.advance(Duration::from_secs(60));
        tracker.record(Component::Llm, Severity::Error, "timeout", vec![]).await;
        let llm = health.component_health(Component::Llm);
        assert_eq!(llm.status, HealthStatus::Error);
        assert_eq!(llm.errors, 1);
    }

    #[tokio::test]
    async fn test_dashboard_snapshot() {
        let (_clock, tracker, health) = setup();
        for i in 0..15 {
            tracker
                .record(Component::Search, Severity::Warning, format!("slow {}", i), vec![])
                .await;
        }

        let snapshot = health.dashboard().await;
        assert_eq!(snapshot.recent_errors.len(), 10);
        assert_eq!(snapshot.recent_errors[0].message, "slow 14");
        assert_eq!(snapshot.status.component_status[&Component::Search], HealthStatus::Warning);
        assert_eq!(snapshot.status.system_status, HealthStatus::Warning);
        assert_eq!(snapshot.trends[&Component::Search][TREND_HOURS - 1], 15);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"]["system_status"], "warning");
        assert_eq!(json["status"]["component_status"]["SEARCH"], "warning");
        assert_eq!(json["trends"]["SEARCH"].as_array().unwrap().len(), TREND_HOURS);
        assert_eq!(json["recent_errors"][0]["severity"], "WARNING");
    }

    #[test]
    fn test_validate() {
        assert!(HealthConfig::default().validate().is_ok());
        assert!(HealthConfig {
            window_hours: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(HealthConfig {
            critical_error_threshold: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
