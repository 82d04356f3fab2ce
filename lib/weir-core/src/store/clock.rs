//! Shared aggregation clock.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};

/// The logical clock all windows synchronize on.
///
/// The clock only moves when the ticker advances it, one granularity step per
/// tick, so every window in the process rolls against the same instant
/// regardless of how long the roll pass itself takes. It is deliberately
/// decoupled from the wall clock after seeding.
pub struct SharedClock {
    epoch_millis: AtomicI64,
}

impl SharedClock {
    /// Creates a clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            epoch_millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Creates a clock seeded from `now`, aligned down to the previous
    /// granularity boundary.
    ///
    /// Alignment keeps bucket edges at stable phases across restarts, which
    /// is what allows persisted window state to be re-adopted.
    pub fn aligned(now: DateTime<Utc>, granularity: TimeDelta) -> Self {
        let step = granularity.num_milliseconds().max(1);
        let millis = now.timestamp_millis();
        Self {
            epoch_millis: AtomicI64::new(millis - millis.rem_euclid(step)),
        }
    }

    /// Returns the current synchronization instant.
    pub fn now(&self) -> DateTime<Utc> {
        from_millis(self.epoch_millis.load(Ordering::Acquire))
    }

    /// Advances the clock by one granularity step and returns the new
    /// synchronization instant.
    pub fn advance(&self, granularity: TimeDelta) -> DateTime<Utc> {
        let step = granularity.num_milliseconds();
        from_millis(self.epoch_millis.fetch_add(step, Ordering::AcqRel) + step)
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    // Only out-of-range for timestamps beyond year 262143, which the clock
    // cannot reach from a wall-clock seed.
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}
