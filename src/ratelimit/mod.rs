//! Rate limiting logic and state management.

mod clock;
mod ledger;
mod limiter;
mod shared;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::{peak_admissions, Ledger, LedgerGuard, LocalLedger};
pub use limiter::{RateLimiter, SharingMode};
pub use shared::SharedLedger;
