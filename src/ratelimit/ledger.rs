//! Admission ledger abstraction and the process-local backend.
//!
//! The limiter runs one algorithm against [`Ledger`]; backends only decide
//! where the timestamps live and which lock guards them.

use parking_lot::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::Result;

/// Storage for admission timestamps plus the lock that guards it.
pub trait Ledger: Send + Sync {
    /// Take exclusive ownership of the ledger.
    ///
    /// Blocks until no other holder remains. The lock is released when the
    /// returned guard is dropped.
    fn lock(&self) -> Result<Box<dyn LedgerGuard + '_>>;
}

/// Exclusive access to the ledger contents, oldest entry first.
pub trait LedgerGuard {
    /// Every recorded admission, oldest first.
    fn entries(&self) -> &[Duration];

    /// Drop every entry for which `now - entry >= period`.
    fn prune_expired(&mut self, now: Duration, period: Duration) -> Result<()>;

    /// Record an admission at `at`.
    fn append(&mut self, at: Duration) -> Result<()>;

    /// Number of recorded admissions.
    fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the ledger holds no admissions.
    fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// The earliest recorded admission.
    fn oldest(&self) -> Option<Duration> {
        self.entries().first().copied()
    }
}

/// Whether an admission at `at` has left the window ending at `now`.
///
/// Entries stamped after `now` (wall clock stepped back) are kept.
pub(crate) fn is_expired(at: Duration, now: Duration, period: Duration) -> bool {
    now.saturating_sub(at) >= period
}

/// Ledger visible to the threads of a single process.
#[derive(Debug, Default)]
pub struct LocalLedger {
    timestamps: Mutex<Vec<Duration>>,
}

impl LocalLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for LocalLedger {
    fn lock(&self) -> Result<Box<dyn LedgerGuard + '_>> {
        Ok(Box::new(LocalGuard {
            timestamps: self.timestamps.lock(),
        }))
    }
}

struct LocalGuard<'a> {
    timestamps: MutexGuard<'a, Vec<Duration>>,
}

impl LedgerGuard for LocalGuard<'_> {
    fn entries(&self) -> &[Duration] {
        &self.timestamps
    }

    fn prune_expired(&mut self, now: Duration, period: Duration) -> Result<()> {
        self.timestamps.retain(|&at| !is_expired(at, now, period));
        Ok(())
    }

    fn append(&mut self, at: Duration) -> Result<()> {
        self.timestamps.push(at);
        Ok(())
    }
}

/// Largest number of admissions falling in any window of width `window`.
///
/// Windows are half-open: two admissions exactly `window` apart never share
/// one, matching how the limiter prunes.
pub fn peak_admissions(timestamps: &[Duration], window: Duration) -> usize {
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();

    let mut start = 0;
    let mut peak = 0;
    for end in 0..sorted.len() {
        while start < end && is_expired(sorted[start], sorted[end], window) {
            start += 1;
        }
        peak = peak.max(end - start + 1);
    }
    peak
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_local_ledger_starts_empty() {
        let ledger = LocalLedger::new();
        let guard = ledger.lock().unwrap();

        assert!(guard.is_empty());
        assert_eq!(guard.oldest(), None);
    }

    #[test]
    fn test_local_ledger_append_keeps_order() {
        let ledger = LocalLedger::new();
        {
            let mut guard = ledger.lock().unwrap();
            guard.append(ms(100)).unwrap();
            guard.append(ms(200)).unwrap();
        }

        let guard = ledger.lock().unwrap();
        assert_eq!(guard.entries(), &[ms(100), ms(200)]);
        assert_eq!(guard.oldest(), Some(ms(100)));
    }

    #[test]
    fn test_prune_removes_entries_at_window_edge() {
        let ledger = LocalLedger::new();
        let mut guard = ledger.lock().unwrap();
        for at in [0, 500, 1000, 1500] {
            guard.append(ms(at)).unwrap();
        }

        // now - 500 == period, so the 500ms entry is expired as well
        guard.prune_expired(ms(2500), ms(2000)).unwrap();

        assert_eq!(guard.entries(), &[ms(1000), ms(1500)]);
    }

    #[test]
    fn test_prune_keeps_future_entries() {
        assert!(!is_expired(ms(3000), ms(1000), ms(500)));
    }

    #[test]
    fn test_peak_admissions_sliding() {
        let stamps = [ms(0), ms(100), ms(200), ms(2000), ms(2150)];

        assert_eq!(peak_admissions(&stamps, ms(2000)), 3);
        assert_eq!(peak_admissions(&stamps, ms(2001)), 4);
        assert_eq!(peak_admissions(&stamps, ms(151)), 2);
    }

    #[test]
    fn test_peak_admissions_unsorted_and_empty() {
        assert_eq!(peak_admissions(&[], ms(1000)), 0);
        assert_eq!(peak_admissions(&[ms(900), ms(0), ms(450)], ms(1000)), 3);
    }
}
