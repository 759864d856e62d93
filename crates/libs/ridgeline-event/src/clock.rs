//! Monotonic time sources for the event loop.

use std::cell::Cell;

use crate::timeval::TimeVal;

/// A monotonic clock sampled on demand.
///
/// `current_time` returns the value cached by the last `advance_time`
/// call, so every callback dispatched in one loop iteration observes the
/// same instant. Reported time is strictly non-decreasing.
pub trait Clock {
    /// Re-sample the underlying time source.
    fn advance_time(&self);

    /// The time recorded by the most recent `advance_time`.
    fn current_time(&self) -> TimeVal;
}

/// Clock backed by `CLOCK_MONOTONIC`.
pub struct SystemClock {
    cached: Cell<TimeVal>,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        let clock = SystemClock {
            cached: Cell::new(TimeVal::ZERO),
        };
        clock.advance_time();
        clock
    }

    fn sample() -> TimeVal {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            log::error!("clock_gettime(CLOCK_MONOTONIC) failed");
            return TimeVal::ZERO;
        }
        TimeVal::new(ts.tv_sec as i64, ts.tv_nsec as i64 / 1000)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn advance_time(&self) {
        let sampled = SystemClock::sample();
        if sampled > self.cached.get() {
            self.cached.set(sampled);
        }
    }

    fn current_time(&self) -> TimeVal {
        self.cached.get()
    }
}

/// Clock advanced explicitly by the caller.
///
/// Lets tests step simulated time through timer expiries without
/// sleeping.
pub struct ManualClock {
    now: Cell<TimeVal>,
}

impl ManualClock {
    pub fn new(start: TimeVal) -> ManualClock {
        ManualClock {
            now: Cell::new(start),
        }
    }

    pub fn set(&self, t: TimeVal) {
        if t >= self.now.get() {
            self.now.set(t);
        }
    }

    pub fn step(&self, delta: TimeVal) {
        self.now.set(self.now.get() + delta);
    }
}

impl Clock for ManualClock {
    fn advance_time(&self) {}

    fn current_time(&self) -> TimeVal {
        self.now.get()
    }
}
