//! Time sources used by the rate limiter.

use parking_lot::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of the current instant plus a way to suspend the caller.
///
/// Instants are expressed as the offset from the UNIX epoch so that
/// timestamps written by one process can be compared by another.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Duration;

    /// Suspend the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`SystemTime`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // A system clock set before 1970 reads as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A virtual clock for tests.
///
/// Time only moves when [`ManualClock::advance`] or [`Clock::sleep`] is
/// called. Every sleep is recorded so tests can assert on wait durations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Create a clock reading `start`.
    pub fn new(start: Duration) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
    }
}
