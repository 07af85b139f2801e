use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use resilience::rate_limit::{RateLimitConfig, WILDCARD};
use resilience::store::StoreResult;
use resilience::{
    Component, Decision, ErrorTracker, ManualClock, MemoryStore, RateLimitRule, RateLimiter,
    ResilienceConfig, ResilienceLayer, Severity, SharedStore, StoreError,
};

/// Memory store that can be switched off
#[derive(Debug)]
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: MemoryStore::with_clock(clock),
            down: AtomicBool::new(false),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn incr(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.check()?;
        self.inner.incr(key, ttl).await
    }

    async fn push_capped(&self, key: &str, value: String, capacity: usize) -> StoreResult<()> {
        self.check()?;
        self.inner.push_capped(key, value, capacity).await
    }

    async fn recent(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.recent(key, limit).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    fn backend(&self) -> &'static str {
        "flaky"
    }
}

fn limiter_with(
    rules: Vec<RateLimitRule>,
    store: Arc<dyn SharedStore>,
    clock: Arc<ManualClock>,
) -> (RateLimiter, Arc<ErrorTracker>) {
    let tracker = Arc::new(ErrorTracker::default().with_clock(clock.clone()));
    let config = RateLimitConfig {
        rules,
        ..Default::default()
    };
    (RateLimiter::new(config, store, tracker.clone(), clock), tracker)
}

#[tokio::test]
async fn first_l_allowed_then_denied_until_window_resets() {
    let clock = Arc::new(ManualClock::fixed());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let limit = 5;
    let (limiter, _) = limiter_with(vec![RateLimitRule::ip(WILDCARD, limit, 60)], store, clock.clone());

    for i in 0..limit {
        let decision = limiter.check("203.0.113.9", "/api/chat").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.info().unwrap().remaining, limit - i - 1);
    }

    let denied = limiter.check("203.0.113.9", "/api/chat").await;
    let retry_after = denied.retry_after().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
    assert!(denied
        .headers()
        .iter()
        .any(|(name, value)| *name == "Retry-After" && *value == retry_after.to_string()));

    clock.advance(Duration::from_secs(retry_after));
    assert!(limiter.check("203.0.113.9", "/api/chat").await.is_allowed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_exceed_limit() {
    let clock = Arc::new(ManualClock::fixed());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let (limiter, _) = limiter_with(vec![RateLimitRule::global(50, 3600)], store, clock);
    let limiter = Arc::new(limiter);

    let mut handles = Vec::new();
    for i in 0..200 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.check(&format!("client-{}", i), "/api/search").await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 50);
}

#[tokio::test]
async fn store_outage_fails_open_with_one_warning_per_transition() {
    let clock = Arc::new(ManualClock::fixed());
    let store = Arc::new(FlakyStore::new(clock.clone()));
    let (limiter, tracker) = limiter_with(
        vec![RateLimitRule::ip(WILDCARD, 1, 60)],
        store.clone(),
        clock,
    );

    let outage_warnings = |records: &[resilience::ErrorRecord]| {
        records
            .iter()
            .filter(|r| r.component == Component::RateLimit && r.severity == Severity::Warning)
            .count()
    };

    assert!(limiter.check("a", "/").await.is_allowed());

    store.set_down(true);
    for _ in 0..20 {
        assert_eq!(limiter.check("a", "/").await, Decision::Allowed(None));
    }
    assert_eq!(outage_warnings(&tracker.recent(100).await), 1);

    store.set_down(false);
    assert!(!limiter.check("a", "/").await.is_allowed());

    store.set_down(true);
    for _ in 0..5 {
        assert!(limiter.check("a", "/").await.is_allowed());
    }
    assert_eq!(outage_warnings(&tracker.recent(100).await), 2);
}

#[tokio::test]
async fn test_shared_store_outage_reports_one_warning_per_layer() {
    let clock = Arc::new(ManualClock::fixed());
    let store = Arc::new(FlakyStore::new(clock.clone()));
    let mut config = ResilienceConfig::default();
    config.rate_limit.rules = vec![RateLimitRule::ip(WILDCARD, 100, 60)];
    let layer = ResilienceLayer::with_parts(config, store.clone(), clock).unwrap();

    store.set_down(true);
    for _ in 0..20 {
        assert_eq!(layer.limiter().check("a", "/").await, Decision::Allowed(None));
    }
    store.set_down(false);

    let recent = layer.tracker().recent(100).await;
    let warnings: Vec<_> = recent
        .iter()
        .filter(|r| r.severity == Severity::Warning)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].component, Component::RateLimit);
}
