//! # Rate Limiting
//!
//! Fixed-window request limits per scope (global, endpoint, client
//! identity), counted in the shared store so every worker sees the same
//! totals. Each applicable rule's counter is bumped with one atomic
//! increment; the first violated rule in global, endpoint, ip order
//! decides the denial.
//!
//! When the store is unreachable requests are allowed and the outage is
//! reported once, not once per request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::{SharedStore, StoreError};
use crate::taxonomy::{Component, Severity};
use crate::tracker::ErrorTracker;
use crate::types::{Error, ErrorKind, Result};

/// Rule key matching every endpoint or identity in its scope
pub const WILDCARD: &str = "*";

/// What a rule counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Endpoint,
    Ip,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Endpoint => "endpoint",
            Scope::Ip => "ip",
        }
    }
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

/// One limit: at most `limit` requests per `window_seconds`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub scope: Scope,
    /// Endpoint path or client identity; `*` matches all
    #[serde(default = "wildcard")]
    pub key: String,
    pub limit: u64,
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub fn global(limit: u64, window_seconds: u64) -> Self {
        Self {
            scope: Scope::Global,
            key: wildcard(),
            limit,
            window_seconds,
        }
    }

    pub fn endpoint<S: Into<String>>(endpoint: S, limit: u64, window_seconds: u64) -> Self {
        Self {
            scope: Scope::Endpoint,
            key: endpoint.into(),
            limit,
            window_seconds,
        }
    }

    pub fn ip<S: Into<String>>(identity: S, limit: u64, window_seconds: u64) -> Self {
        Self {
            scope: Scope::Ip,
            key: identity.into(),
            limit,
            window_seconds,
        }
    }

    fn is_wildcard(&self) -> bool {
        self.key == WILDCARD
    }
}

/// Configured rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Counter key prefix in the shared store
    pub key_prefix: String,
    pub rules: Vec<RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "ratelimit".to_string(),
            rules: vec![
                RateLimitRule::global(300, 3600),
                RateLimitRule::ip(WILDCARD, 60, 60),
                RateLimitRule::endpoint("api/chat", 10, 60),
                RateLimitRule::endpoint("api/search", 5, 60),
            ],
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            if rule.limit == 0 || rule.window_seconds == 0 {
                return Err(Error::new(
                    ErrorKind::Configuration,
                    format!(
                        "rate limit rule {} '{}' needs a positive limit and window",
                        rule.scope.as_str(),
                        rule.key
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Quota state reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub scope: Scope,
    pub limit: u64,
    pub remaining: u64,
    /// Unix time at which the window resets
    pub reset: i64,
}

/// Outcome of [`RateLimiter::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Allowed; carries the most constraining rule's quota, if any rule applied
    Allowed(Option<RateLimitInfo>),
    /// Denied by the first violated rule
    Denied {
        info: RateLimitInfo,
        /// Whole seconds until the violated window resets, at least 1
        retry_after: u64,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    pub fn info(&self) -> Option<&RateLimitInfo> {
        match self {
            Decision::Allowed(info) => info.as_ref(),
            Decision::Denied { info, .. } => Some(info),
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Decision::Denied { retry_after, .. } => Some(*retry_after),
            Decision::Allowed(_) => None,
        }
    }

    /// Response headers describing the quota
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(info) = self.info() {
            headers.push(("X-RateLimit-Limit", info.limit.to_string()));
            headers.push(("X-RateLimit-Remaining", info.remaining.to_string()));
            headers.push(("X-RateLimit-Reset", info.reset.to_string()));
        }
        if let Some(retry_after) = self.retry_after() {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }
}

struct Evaluation<'a> {
    rule: &'a RateLimitRule,
    count: u64,
    reset: i64,
}

/// Shared-store fixed-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    rules: Vec<RateLimitRule>,
    store: Arc<dyn SharedStore>,
    tracker: Arc<ErrorTracker>,
    clock: Arc<dyn Clock>,
    store_degraded: AtomicBool,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn SharedStore>,
        tracker: Arc<ErrorTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut rules = config.rules.clone();
        // Stable: keeps configured order within a scope
        rules.sort_by_key(|rule| rule.scope);

        Self {
            config,
            rules,
            store,
            tracker,
            clock,
            store_degraded: AtomicBool::new(false),
        }
    }

    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    /// Counts one request from `identity` to `endpoint` and decides on it
    pub async fn check(&self, identity: &str, endpoint: &str) -> Decision {
        if !self.config.enabled {
            return Decision::Allowed(None);
        }

        let endpoint = normalize_endpoint(endpoint);
        let now = self.clock.unix_seconds();
        let mut evaluations = Vec::new();

        for rule in self.applicable(identity, endpoint) {
            let window = rule.window_seconds.max(1) as i64;
            let window_start = now.div_euclid(window) * window;
            let subject = match rule.scope {
                Scope::Global => "all",
                Scope::Endpoint => endpoint,
                Scope::Ip => identity,
            };
            let key = format!(
                "{}:{}:{}:{}:{}",
                self.config.key_prefix,
                rule.scope.as_str(),
                subject,
                window,
                window_start
            );

            match self
                .store
                .incr(&key, Duration::from_secs(window as u64))
                .await
            {
                Ok(count) => evaluations.push(Evaluation {
                    rule,
                    count,
                    reset: window_start + window,
                }),
                Err(err) => return self.fail_open(err),
            }
        }
        self.note_store_recovered();

        if let Some(violated) = evaluations.iter().find(|e| e.count > e.rule.limit) {
            let retry_after = (violated.reset - now).max(1) as u64;
            counter!(
                "resilience.rate_limit.denied",
                1,
                "scope" => violated.rule.scope.as_str()
            );
            warn!(
                scope = violated.rule.scope.as_str(),
                identity = %identity,
                endpoint = %endpoint,
                limit = violated.rule.limit,
                retry_after,
                "Rate limit exceeded"
            );
            return Decision::Denied {
                info: RateLimitInfo {
                    scope: violated.rule.scope,
                    limit: violated.rule.limit,
                    remaining: 0,
                    reset: violated.reset,
                },
                retry_after,
            };
        }

        counter!("resilience.rate_limit.allowed", 1);
        let tightest = evaluations
            .iter()
            .min_by_key(|e| e.rule.limit.saturating_sub(e.count))
            .map(|e| RateLimitInfo {
                scope: e.rule.scope,
                limit: e.rule.limit,
                remaining: e.rule.limit.saturating_sub(e.count),
                reset: e.reset,
            });
        Decision::Allowed(tightest)
    }

    // Global rules always apply. For endpoint and ip, an exact key match
    // shadows the wildcard rule.
    fn applicable<'a>(
        &'a self,
        identity: &'a str,
        endpoint: &'a str,
    ) -> impl Iterator<Item = &'a RateLimitRule> + 'a {
        self.rules.iter().filter(move |rule| {
            let subject = match rule.scope {
                Scope::Global => return true,
                Scope::Endpoint => endpoint,
                Scope::Ip => identity,
            };
            if rule.is_wildcard() {
                !self.rules.iter().any(|other| {
                    other.scope == rule.scope && !other.is_wildcard() && matches_key(other, subject)
                })
            } else {
                matches_key(rule, subject)
            }
        })
    }

    // The store that failed may back the tracker too, so the report stays local
    fn fail_open(&self, err: StoreError) -> Decision {
        counter!("resilience.rate_limit.fail_open", 1);

        if self.store_degraded.swap(true, Ordering::SeqCst) {
            debug!(error = %err, "Rate limit store still unavailable, allowing request");
            return Decision::Allowed(None);
        }

        warn!(error = %err, "Rate limit store unavailable, allowing requests");
        self.tracker.record_local_only(
            Component::RateLimit,
            Severity::Warning,
            "Rate limit store unavailable; requests are not being limited",
            vec![err.to_string()],
        );
        Decision::Allowed(None)
    }

    fn note_store_recovered(&self) {
        if self.store_degraded.swap(false, Ordering::SeqCst) {
            info!("Rate limit store available again");
        }
    }
}

fn matches_key(rule: &RateLimitRule, subject: &str) -> bool {
    match rule.scope {
        Scope::Endpoint => normalize_endpoint(&rule.key) == subject,
        _ => rule.key == subject,
    }
}

fn normalize_endpoint(endpoint: &str) -> &str {
    endpoint.trim_start_matches('/').trim_end_matches('/')
}
