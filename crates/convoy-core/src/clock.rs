//! Clock seam
//!
//! Time-dependent components (time-series TTL, alert history, deployment
//! records) take a clock by contract so tests can drive it.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Current time as unix seconds
    fn now_unix(&self) -> i64 {
        self.now().timestamp()
    }
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at a fixed instant
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self { now: RwLock::new(now) }
    }

    /// Start at the unix epoch
    pub fn at_epoch() -> Self {
        Self::starting_at(DateTime::<Utc>::from_timestamp(0, 0).unwrap())
    }

    /// Advance by a duration
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    /// Advance by whole seconds
    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_epoch();
        assert_eq!(clock.now_unix(), 0);
        clock.advance_secs(90);
        assert_eq!(clock.now_unix(), 90);
    }
}
