// Pacing clock and deadline scheduling
//
// Every cadence decision in the pacing loop goes through a `PacingClock`, a
// monotonic elapsed-time source that wall-clock adjustments cannot move.
// `PacingSchedule` holds the running "next submission" deadline and advances
// it additively so processing jitter never accumulates into drift.

use std::fmt::Debug;
use std::time::{Duration, Instant};
use tracing::info;

/// Monotonic time source used for cadence decisions.
///
/// `now()` returns the elapsed time since the clock's origin. It must never go
/// backwards and must not follow calendar time.
pub trait PacingClock: Send + Sync + Debug {
    fn now(&self) -> Duration;
}

/// `PacingClock` backed by `std::time::Instant`
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PacingClock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Running submission deadline for a fixed cadence.
#[derive(Debug, Clone)]
pub struct PacingSchedule {
    interval: Duration,
    started_at: Duration,
    next_deadline: Duration,
    ticks: u64,
}

impl PacingSchedule {
    /// Start a schedule whose first deadline is `now` (the first chunk goes out immediately).
    pub fn starting_at(now: Duration, interval: Duration) -> Self {
        info!(
            "🔄 SCHEDULE START: cadence {:.3}ms starting at {:.3}ms",
            interval.as_secs_f64() * 1000.0,
            now.as_secs_f64() * 1000.0
        );
        Self {
            interval,
            started_at: now,
            next_deadline: now,
            ticks: 0,
        }
    }

    pub fn next_deadline(&self) -> Duration {
        self.next_deadline
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of deadlines consumed so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Time left until the next deadline, zero if it already passed
    pub fn remaining(&self, now: Duration) -> Duration {
        self.next_deadline.saturating_sub(now)
    }

    pub fn is_due(&self, now: Duration) -> bool {
        now >= self.next_deadline
    }

    /// How far past the deadline `now` is, zero if early
    pub fn lateness(&self, now: Duration) -> Duration {
        now.saturating_sub(self.next_deadline)
    }

    /// Consume the current deadline. Always `deadline += interval`, never `now + interval`.
    pub fn advance(&mut self) {
        self.next_deadline += self.interval;
        self.ticks += 1;
    }

    /// Ideal elapsed time after `ticks` submissions
    pub fn expected_elapsed(&self) -> Duration {
        self.next_deadline - self.started_at
    }

    /// Actual elapsed time minus ideal elapsed time, in milliseconds
    pub fn drift_ms(&self, now: Duration) -> f64 {
        let actual = now.saturating_sub(self.started_at).as_secs_f64();
        let ideal = self.expected_elapsed().as_secs_f64();
        (actual - ideal) * 1000.0
    }
}
