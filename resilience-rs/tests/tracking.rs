use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use resilience::tracker::{TrackerConfig, TREND_HOURS};
use resilience::{
    Component, Error, ErrorId, ErrorTracker, HealthAggregator, HealthStatus, ManualClock,
    MemoryStore, ResilienceConfig, ResilienceLayer, Severity,
};

fn is_well_formed(id: &str) -> bool {
    let parts: Vec<&str> = id.splitn(4, '-').collect();
    if parts.len() != 4 || parts[0] != "E" {
        return false;
    }
    let (tag, hex, ts) = (parts[1], parts[2], parts[3]);
    let tag_ok = !tag.is_empty() && tag.chars().all(|c| c.is_ascii_uppercase() || c == '_');
    let hex_ok = hex.len() == 6 && hex.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c));
    let ts_ok = !ts.is_empty() && ts.chars().all(|c| c.is_ascii_digit());
    tag_ok && hex_ok && ts_ok
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ten_thousand_concurrent_records_get_distinct_ids() {
    let clock = Arc::new(ManualClock::fixed());
    let tracker = Arc::new(ErrorTracker::new(TrackerConfig::default()).with_clock(clock));

    let mut handles = Vec::with_capacity(10_000);
    for i in 0..10_000usize {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            let component = Component::ALL[i % Component::ALL.len()];
            tracker
                .record(component, Severity::Error, format!("failure {}", i), vec![])
                .await
                .id
        }));
    }

    let mut ids = HashSet::with_capacity(10_000);
    for handle in handles {
        let id = handle.await.unwrap();
        assert!(is_well_formed(&id), "malformed id {}", id);
        assert!(ErrorId::parse(&id).is_some());
        assert!(ids.insert(id));
    }
    assert_eq!(ids.len(), 10_000);
}

#[tokio::test]
async fn ring_keeps_newest_min_of_capacity_and_count() {
    for (capacity, count) in [(5usize, 3usize), (5, 5), (5, 12), (100, 250)] {
        let tracker = ErrorTracker::new(TrackerConfig {
            capacity,
            ..Default::default()
        });
        for i in 0..count {
            tracker
                .record(Component::Search, Severity::Warning, i.to_string(), vec![])
                .await;
        }

        let recent = tracker.recent(usize::MAX).await;
        assert_eq!(recent.len(), capacity.min(count));
        let expected: Vec<String> = (0..count).rev().take(capacity).map(|i| i.to_string()).collect();
        let got: Vec<String> = recent.into_iter().map(|r| r.message).collect();
        assert_eq!(got, expected);
    }
}

#[tokio::test]
async fn trends_rotate_out_the_oldest_hour() {
    let clock = Arc::new(ManualClock::fixed());
    let tracker = ErrorTracker::new(TrackerConfig::default()).with_clock(clock.clone());

    for hour in 0..25 {
        if hour > 0 {
            clock.advance(Duration::from_secs(3600));
        }
        tracker
            .record(Component::Llm, Severity::Error, format!("hour {}", hour), vec![])
            .await;
    }

    let llm = &tracker.trends()[&Component::Llm];
    assert_eq!(llm.len(), TREND_HOURS);
    assert!(llm.iter().all(|count| *count == 1));
    assert_eq!(llm.iter().sum::<u64>(), 24);
}

#[tokio::test]
async fn one_critical_escalates_component_and_system() {
    let clock = Arc::new(ManualClock::fixed());
    let tracker = Arc::new(ErrorTracker::default().with_clock(clock));
    let health = HealthAggregator::new(tracker.clone(), Default::default());

    tracker
        .record(Component::Search, Severity::Warning, "slow", vec![])
        .await;
    assert_eq!(health.system_status(), HealthStatus::Healthy);

    tracker
        .record(Component::Store, Severity::Critical, "unreachable", vec![])
        .await;
    assert_eq!(health.component_status(Component::Store), HealthStatus::Critical);
    assert_eq!(health.system_status(), HealthStatus::Critical);
    assert_eq!(health.health_check().1, 503);
}

#[tokio::test]
async fn layer_reports_user_facing_errors() {
    let clock = Arc::new(ManualClock::fixed());
    let layer = ResilienceLayer::with_parts(
        ResilienceConfig::default(),
        Arc::new(MemoryStore::with_clock(clock.clone())),
        clock,
    )
    .unwrap();

    let rejected = layer
        .reject_invalid(&Error::validation("return date is before departure"))
        .await;
    let record = layer.tracker().get(&rejected.error_id).await.unwrap();
    assert_eq!(record.severity, Severity::Warning);
    assert_eq!(record.component, Component::Validation);
    assert!(rejected.message.starts_with("return date is before departure"));

    let internal = layer
        .report(&Error::internal("index 7 out of range for slice of length 3"))
        .await;
    let record = layer.tracker().get(&internal.error_id).await.unwrap();
    assert_eq!(record.severity, Severity::Critical);
    assert!(!internal.message.contains("index 7"));
    assert!(internal.message.ends_with(&internal.error_id));
    assert_eq!(layer.health().system_status(), HealthStatus::Critical);
}
