//! Time source for record and lifecycle timestamps

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Source of "now"
///
/// Clocks may be skewed between writers; lifecycle stamps are clamped so
/// they never precede the previous stamp on the same record.
pub trait Clock: Send + Sync + Debug {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
