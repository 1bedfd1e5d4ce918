//! Manually advanced clock for deterministic tests

use appops_core::{Clock, Timestamp};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Wall-clock offset added to the monotonic reading
const WALL_EPOCH_MS: u64 = 1_700_000_000_000;

/// Clock that only moves when told to
///
/// Clones share the same time, so a test can keep a handle after passing
/// the clock to the engine.
#[derive(Debug, Clone)]
pub struct ManualClock {
    elapsed_ms: Arc<Mutex<u64>>,
}

impl ManualClock {
    /// Create a clock whose monotonic reading starts at `elapsed_ms`
    pub fn new(elapsed_ms: u64) -> Self {
        Self {
            elapsed_ms: Arc::new(Mutex::new(elapsed_ms)),
        }
    }

    /// Advance both clocks by `ms` milliseconds
    pub fn advance_ms(&self, ms: u64) {
        *self.elapsed_ms.lock() += ms;
    }

    /// Advance both clocks by `duration`
    pub fn advance(&self, duration: Duration) {
        self.advance_ms(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }

    /// Set the monotonic reading
    pub fn set_elapsed_ms(&self, elapsed_ms: u64) {
        *self.elapsed_ms.lock() = elapsed_ms;
    }

    /// Current monotonic reading
    pub fn elapsed_ms(&self) -> u64 {
        *self.elapsed_ms.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let elapsed_ms = self.elapsed_ms();
        Timestamp {
            wall_ms: WALL_EPOCH_MS + elapsed_ms,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_time() {
        let clock = ManualClock::new(10);
        let handle = clock.clone();
        handle.advance_ms(5);
        assert_eq!(clock.now().elapsed_ms, 15);
        assert_eq!(clock.now().wall_ms - WALL_EPOCH_MS, 15);
    }
}
