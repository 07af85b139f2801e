//! # Error Tracker
//!
//! Records every classified error under a unique id, keeps a bounded ring
//! of recent records, and maintains per-component hourly trend buckets for
//! the last 24 hours.
//!
//! Error ids must stay unique per tracker within one second even under
//! heavy load, so the 24-bit "random" part of an id is a keyed permutation
//! of an atomic sequence number rather than an independent random draw.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::lock;
use crate::logging::log_record;
use crate::store::{SharedStore, StoreError};
use crate::taxonomy::{classify, Component, ErrorId, Severity, ERROR_ID_RANDOM_BITS};
use crate::types::Error;

/// Hours of trend history kept per component
pub const TREND_HOURS: usize = 24;

const RECENT_ERRORS_KEY: &str = "resilience:errors:recent";
const ID_MASK: u32 = (1 << ERROR_ID_RANDOM_BITS) - 1;

/// Bounds applied to every record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Ring buffer capacity for recent errors
    pub capacity: usize,
    /// Maximum number of detail lines kept per record
    pub max_details: usize,
    /// Maximum characters per detail line
    pub max_detail_len: usize,
    /// Maximum characters of the message
    pub max_message_len: usize,
    /// Mirror recent errors into the shared store when one is configured
    pub store_backed: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_details: 20,
            max_detail_len: 500,
            max_message_len: 1000,
            store_backed: true,
        }
    }
}

/// One recorded error occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub component: Component,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Produces 24-bit id suffixes that never repeat within 2^24 draws.
///
/// A lock-free sequence is pushed through a bijection on 24-bit values
/// keyed per tracker, so suffixes look random but cannot collide.
#[derive(Debug)]
struct IdSequence {
    key: u32,
    next: AtomicU32,
}

impl IdSequence {
    fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            key: rng.gen::<u32>() & ID_MASK,
            next: AtomicU32::new(rng.gen()),
        }
    }

    fn next(&self) -> u32 {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        permute(n, self.key)
    }
}

// Each step is a bijection on 24-bit values
fn permute(value: u32, key: u32) -> u32 {
    let mut v = (value ^ key) & ID_MASK;
    v = v.wrapping_mul(0x9E_3779) & ID_MASK;
    v ^= v >> 12;
    v = v.wrapping_mul(0x5B_D1E9) & ID_MASK;
    v ^= v >> 11;
    v
}

#[derive(Debug, Clone, Copy)]
struct HourBucket {
    hour: i64,
    counts: [u64; 5],
}

impl Default for HourBucket {
    fn default() -> Self {
        Self {
            hour: i64::MIN,
            counts: [0; 5],
        }
    }
}

/// Fixed ring of hourly buckets indexed by `hour % 24`.
///
/// A slot whose stored hour is stale is treated as zero, so buckets never
/// need a background reset and only the current hour is ever written.
#[derive(Debug, Clone, Default)]
struct TrendRing {
    buckets: [HourBucket; TREND_HOURS],
}

impl TrendRing {
    fn slot(hour: i64) -> usize {
        hour.rem_euclid(TREND_HOURS as i64) as usize
    }

    fn bump(&mut self, hour: i64, severity: Severity) {
        let bucket = &mut self.buckets[Self::slot(hour)];
        if bucket.hour < hour {
            *bucket = HourBucket {
                hour,
                counts: [0; 5],
            };
        }
        // Older than the slot's current hour: out of retention
        if bucket.hour == hour {
            bucket.counts[severity.index()] += 1;
        }
    }

    fn counts(&self, hour: i64) -> [u64; 5] {
        let bucket = &self.buckets[Self::slot(hour)];
        if bucket.hour == hour {
            bucket.counts
        } else {
            [0; 5]
        }
    }
}

/// Per-hour counts for one component, oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyCounts {
    /// Hours since the unix epoch
    pub hour: i64,
    /// Counts indexed by [`Severity::index`]
    pub counts: [u64; 5],
}

impl HourlyCounts {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn of(&self, severity: Severity) -> u64 {
        self.counts[severity.index()]
    }
}

/// Error recorder shared by every worker
#[derive(Debug)]
pub struct ErrorTracker {
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SharedStore>>,
    ids: IdSequence,
    recent: Mutex<VecDeque<ErrorRecord>>,
    /// Records the shared store never received, newest first
    unmirrored: Mutex<VecDeque<ErrorRecord>>,
    trends: Mutex<HashMap<Component, TrendRing>>,
    store_degraded: AtomicBool,
}

impl ErrorTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            clock: Arc::new(SystemClock),
            store: None,
            ids: IdSequence::new(),
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            unmirrored: Mutex::new(VecDeque::new()),
            trends: Mutex::new(HashMap::new()),
            store_degraded: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mirrors recent errors into `store` so every process sees them
    pub fn with_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Hours since the unix epoch according to the tracker's clock
    pub fn current_hour(&self) -> i64 {
        self.clock.unix_seconds().div_euclid(3600)
    }

    /// Records an occurrence and returns the stored record
    pub async fn record<S: Into<String>>(
        &self,
        component: Component,
        severity: Severity,
        message: S,
        details: Vec<String>,
    ) -> ErrorRecord {
        let record = self.build_record(component, severity, message.into(), details);
        self.record_local(&record);
        log_record(&record);

        if let Some(store) = self.mirror_store() {
            self.mirror(store, &record).await;
        }

        record
    }

    /// Records without touching the shared store.
    ///
    /// Used to report that store's own outage, so the report cannot raise a
    /// second outage notice. The record still shows up in [`recent`](Self::recent).
    pub fn record_local_only<S: Into<String>>(
        &self,
        component: Component,
        severity: Severity,
        message: S,
        details: Vec<String>,
    ) -> ErrorRecord {
        let record = self.build_record(component, severity, message.into(), details);
        self.record_local(&record);
        log_record(&record);
        if self.mirror_store().is_some() {
            self.hold_unmirrored(&record);
        }
        record
    }

    /// Classifies and records an [`Error`]
    pub async fn record_error(&self, error: &Error) -> ErrorRecord {
        let (component, severity) = classify(error);
        self.record_error_as(error, component, severity).await
    }

    /// Records an [`Error`] under an explicit component and severity
    pub async fn record_error_as(
        &self,
        error: &Error,
        component: Component,
        severity: Severity,
    ) -> ErrorRecord {
        let mut details = error.details.clone();
        details.extend(error.chain().into_iter().skip(1));
        self.record(component, severity, error.message.clone(), details)
            .await
    }

    /// Up to `limit` most recent records, newest first
    pub async fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let limit = limit.min(self.config.capacity);

        if let Some(store) = self.mirror_store() {
            match store.recent(RECENT_ERRORS_KEY, limit).await {
                Ok(raw) => {
                    self.note_store_recovered();
                    let shared = raw
                        .iter()
                        .filter_map(|entry| serde_json::from_str(entry).ok())
                        .collect();
                    return self.merge_unmirrored(shared, limit);
                }
                Err(err) => self.note_store_failure(&err),
            }
        }

        self.recent_local(limit)
    }

    /// Looks a record up by id among the retained records
    pub async fn get(&self, id: &str) -> Option<ErrorRecord> {
        let local = lock(&self.recent).iter().find(|r| r.id == id).cloned();
        if local.is_some() {
            return local;
        }
        if self.mirror_store().is_none() {
            return None;
        }
        self.recent(self.config.capacity)
            .await
            .into_iter()
            .find(|r| r.id == id)
    }

    /// 24 hourly counts per component, oldest first, current hour last
    pub fn trends(&self) -> BTreeMap<Component, Vec<u64>> {
        let hour = self.current_hour();
        let trends = lock(&self.trends);

        Component::ALL
            .iter()
            .map(|component| {
                let counts = (0..TREND_HOURS as i64)
                    .rev()
                    .map(|back| {
                        trends
                            .get(component)
                            .map(|ring| ring.counts(hour - back).iter().sum::<u64>())
                            .unwrap_or(0)
                    })
                    .collect();
                (*component, counts)
            })
            .collect()
    }

    /// Per-severity counts for the last `hours` hours (current included),
    /// oldest first
    pub fn hourly_counts(&self, component: Component, hours: u32) -> Vec<HourlyCounts> {
        let hours = (hours as i64).clamp(1, TREND_HOURS as i64);
        let hour = self.current_hour();
        let trends = lock(&self.trends);
        let ring = trends.get(&component);

        (0..hours)
            .rev()
            .map(|back| HourlyCounts {
                hour: hour - back,
                counts: ring.map(|r| r.counts(hour - back)).unwrap_or([0; 5]),
            })
            .collect()
    }

    fn mirror_store(&self) -> Option<&Arc<dyn SharedStore>> {
        if self.config.store_backed {
            self.store.as_ref()
        } else {
            None
        }
    }

    fn build_record(
        &self,
        component: Component,
        severity: Severity,
        message: String,
        details: Vec<String>,
    ) -> ErrorRecord {
        let timestamp = self.clock.now();
        let id = ErrorId::new(component, self.ids.next(), timestamp.timestamp());

        ErrorRecord {
            id: id.to_string(),
            component,
            severity,
            message: truncate(&message, self.config.max_message_len),
            details: self.bound_details(details),
            timestamp,
        }
    }

    fn bound_details(&self, details: Vec<String>) -> Vec<String> {
        let max = self.config.max_details;
        let total = details.len();
        let mut bounded: Vec<String> = details
            .iter()
            .take(max)
            .map(|line| truncate(line, self.config.max_detail_len))
            .collect();

        if total > max && max > 0 {
            bounded[max - 1] = format!("... {} more lines", total - max + 1);
        }
        bounded
    }

    fn record_local(&self, record: &ErrorRecord) {
        {
            let mut recent = lock(&self.recent);
            if self.config.capacity > 0 {
                while recent.len() >= self.config.capacity {
                    recent.pop_back();
                }
                recent.push_front(record.clone());
            }
            gauge!("resilience.errors.retained", recent.len() as f64);
        }

        // Hour at bump time, not the record timestamp
        let mut trends = lock(&self.trends);
        let hour = self.current_hour();
        trends
            .entry(record.component)
            .or_default()
            .bump(hour, record.severity);
        drop(trends);

        counter!(
            "resilience.errors.recorded",
            1,
            "component" => record.component.as_str(),
            "severity" => record.severity.as_str()
        );
    }

    fn hold_unmirrored(&self, record: &ErrorRecord) {
        if self.config.capacity == 0 {
            return;
        }
        let mut unmirrored = lock(&self.unmirrored);
        while unmirrored.len() >= self.config.capacity {
            unmirrored.pop_back();
        }
        unmirrored.push_front(record.clone());
    }

    // Store list plus records it never received, newest first
    fn merge_unmirrored(&self, mut records: Vec<ErrorRecord>, limit: usize) -> Vec<ErrorRecord> {
        {
            let unmirrored = lock(&self.unmirrored);
            if unmirrored.is_empty() {
                return records;
            }
            let shared: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
            let missing: Vec<ErrorRecord> = unmirrored
                .iter()
                .filter(|r| !shared.contains(r.id.as_str()))
                .cloned()
                .collect();
            records.extend(missing);
        }
        // Stable: ties keep store order ahead of local order
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        records
    }

    fn recent_local(&self, limit: usize) -> Vec<ErrorRecord> {
        lock(&self.recent).iter().take(limit).cloned().collect()
    }

    async fn mirror(&self, store: &Arc<dyn SharedStore>, record: &ErrorRecord) {
        let result = match serde_json::to_string(record) {
            Ok(encoded) => {
                store
                    .push_capped(RECENT_ERRORS_KEY, encoded, self.config.capacity)
                    .await
            }
            Err(err) => Err(StoreError::from(err)),
        };

        match result {
            Ok(()) => self.note_store_recovered(),
            Err(err) => {
                self.note_store_failure(&err);
                self.hold_unmirrored(record);
            }
        }
    }

    // Reports a store outage once, as a local-only record
    fn note_store_failure(&self, err: &StoreError) {
        counter!("resilience.tracker.store_failures", 1);
        if self.store_degraded.swap(true, Ordering::SeqCst) {
            debug!(error = %err, "Error store still unavailable");
            return;
        }

        warn!(error = %err, "Error store unavailable, keeping errors in process");
        let record = self.build_record(
            Component::Store,
            Severity::Warning,
            "Shared error store unavailable; recording errors locally".to_string(),
            vec![err.to_string()],
        );
        self.record_local(&record);
        log_record(&record);
        self.hold_unmirrored(&record);
    }

    fn note_store_recovered(&self) {
        if self.store_degraded.swap(false, Ordering::SeqCst) {
            info!("Error store available again");
        }
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

/// Truncates to at most `max` characters on a char boundary
pub(crate) fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
