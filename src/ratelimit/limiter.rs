//! Core rate limiter implementation.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::ledger::{Ledger, LedgerGuard, LocalLedger};
use super::shared::SharedLedger;
use crate::error::{KronosError, Result};
use crate::logging::Logger;

/// Which callers share one limiter's admission ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SharingMode {
    /// Threads of the current process, through a shared handle.
    #[default]
    SingleProcess,
    /// Any process that opens the ledger file at this path.
    CrossProcess(PathBuf),
}

/// Sliding-window rate limiter.
///
/// Admits at most `limit` calls to [`RateLimiter::acquire`] within any
/// trailing `time_period`. Share one instance between threads with an
/// `Arc`; processes share state by building limiters on the same
/// [`SharingMode::CrossProcess`] path.
///
/// The ledger lock is held for the whole admission, including any wait.
/// A caller that has to wait therefore stalls every other caller until it
/// is admitted: admissions are strictly serialized.
pub struct RateLimiter {
    limit: usize,
    time_period: Duration,
    mode: SharingMode,
    ledger: Box<dyn Ledger>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
}

impl RateLimiter {
    /// Create a limiter timed by the system clock.
    pub fn new(
        limit: usize,
        time_period: Duration,
        mode: SharingMode,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        Self::with_clock(limit, time_period, mode, Arc::new(SystemClock), logger)
    }

    /// Create a limiter timed by `clock`.
    ///
    /// Cross-process limiters compare timestamps written by other processes,
    /// so every participant needs a clock reading the same epoch.
    pub fn with_clock(
        limit: usize,
        time_period: Duration,
        mode: SharingMode,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        validate(limit, time_period)?;

        let ledger: Box<dyn Ledger> = match &mode {
            SharingMode::SingleProcess => Box::new(LocalLedger::new()),
            SharingMode::CrossProcess(path) => Box::new(SharedLedger::open(path)?),
        };
        Self::with_ledger(limit, time_period, mode, ledger, clock, logger)
    }

    /// Create a limiter over a caller-supplied ledger backend.
    ///
    /// `mode` is reported by [`RateLimiter::mode`]; it should describe who
    /// can see `ledger`.
    pub fn with_ledger(
        limit: usize,
        time_period: Duration,
        mode: SharingMode,
        ledger: Box<dyn Ledger>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        validate(limit, time_period)?;

        logger.info(&format!(
            "RateLimiter initialized with {} requests per {} seconds",
            limit,
            time_period.as_secs_f64()
        ));

        Ok(Self {
            limit,
            time_period,
            mode,
            ledger,
            clock,
            logger,
        })
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Width of the trailing window.
    pub fn time_period(&self) -> Duration {
        self.time_period
    }

    /// Which callers share this limiter's ledger.
    pub fn mode(&self) -> &SharingMode {
        &self.mode
    }

    /// Block until the call can be admitted, then record it.
    ///
    /// Returns the instant written to the ledger. Errors only come from the
    /// ledger backend (e.g. I/O on a shared ledger file); the admission
    /// itself never fails.
    pub fn acquire(&self) -> Result<Duration> {
        let mut ledger = self.ledger.lock()?;

        loop {
            let now = self.clock.now();
            ledger.prune_expired(now, self.time_period)?;

            match self.wait_time(&*ledger, now) {
                Some(wait) => {
                    self.logger
                        .debug(&format!("Waiting for {} seconds", wait.as_secs_f64()));
                    self.clock.sleep(wait);
                }
                None => {
                    ledger.append(now)?;
                    trace!(
                        admitted = ledger.len(),
                        limit = self.limit,
                        "Admission recorded"
                    );
                    return Ok(now);
                }
            }
        }
    }

    /// Like [`RateLimiter::acquire`], run on tokio's blocking thread pool.
    pub async fn acquire_async(self: Arc<Self>) -> Result<Duration> {
        tokio::task::spawn_blocking(move || self.acquire())
            .await
            .map_err(|e| KronosError::RateLimit(format!("admission task failed: {}", e)))?
    }

    /// Number of admissions currently inside the trailing window.
    pub fn admitted_in_window(&self) -> Result<usize> {
        let mut ledger = self.ledger.lock()?;
        ledger.prune_expired(self.clock.now(), self.time_period)?;
        Ok(ledger.len())
    }

    /// How long a caller at `now` must wait, if the window is full.
    ///
    /// Capped at one period so a wall clock stepping backwards cannot park
    /// callers for longer than a window.
    fn wait_time(&self, ledger: &dyn LedgerGuard, now: Duration) -> Option<Duration> {
        if ledger.len() < self.limit {
            return None;
        }

        let oldest = ledger.oldest()?;
        let wait = (oldest + self.time_period)
            .saturating_sub(now)
            .min(self.time_period);
        (!wait.is_zero()).then_some(wait)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("time_period", &self.time_period)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

fn validate(limit: usize, time_period: Duration) -> Result<()> {
    if limit == 0 {
        return Err(KronosError::InvalidConfiguration(
            "limit must be greater than zero".to_string(),
        ));
    }
    if time_period.is_zero() {
        return Err(KronosError::InvalidConfiguration(
            "time period must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
