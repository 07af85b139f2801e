//! Clock abstraction for injectable time source.
//!
//! Trend buckets, rate-limit windows and error ids all read wall-clock
//! time through [`Clock`] so tests can move time forward deterministically.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Current unix time in whole seconds.
    fn unix_seconds(&self) -> i64 {
        self.now().timestamp()
    }
}

/// System clock implementation (production use).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock, shareable across tasks.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Starts at the given unix time in seconds.
    pub fn at_unix(seconds: i64) -> Self {
        Self {
            millis: AtomicI64::new(seconds.saturating_mul(1000)),
        }
    }

    /// Starts at 2026-01-15 12:00:00 UTC.
    pub fn fixed() -> Self {
        Self::at_unix(1_768_478_400)
    }

    pub fn advance(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set_unix(&self, seconds: i64) {
        self.millis.store(seconds.saturating_mul(1000), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_unix(1_000);
        assert_eq!(clock.unix_seconds(), 1_000);

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.unix_seconds(), 1_001);

        clock.advance(Duration::from_secs(3_600));
        assert_eq!(clock.unix_seconds(), 4_601);

        clock.set_unix(42);
        assert_eq!(clock.now().timestamp(), 42);
    }

    #[test]
    fn test_fixed_clock_is_midday() {
        let clock = ManualClock::fixed();
        assert_eq!(clock.now().to_rfc3339(), "2026-01-15T12:00:00+00:00");
    }
}
