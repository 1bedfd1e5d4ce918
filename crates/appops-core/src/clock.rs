//! Time source
//!
//! Usage records store wall-clock times for reporting and monotonic times
//! for durations and settle windows. Tests inject a manual clock.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A point in time on both clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Milliseconds since the Unix epoch
    pub wall_ms: u64,
    /// Milliseconds on a monotonic clock
    pub elapsed_ms: u64,
}

/// Source of timestamps
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// Clock backed by the operating system
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose monotonic origin is now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let elapsed_ms = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        Timestamp {
            wall_ms,
            elapsed_ms,
        }
    }
}
