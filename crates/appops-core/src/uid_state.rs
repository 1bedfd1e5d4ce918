//! Process importance of a uid, ordered from most to least important.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Importance bucket of a uid.
///
/// The derived ordering follows declaration order: `Persistent < Top < ...`,
/// so "more important" compares as "less than".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum UidState {
    /// Persistent system process
    Persistent,
    /// Hosts the top visible activity
    Top,
    /// Running a foreground service with location type
    ForegroundServiceLocation,
    /// Running a foreground service
    ForegroundService,
    /// Otherwise user-perceptible
    Foreground,
    /// Background
    Background,
    /// Cached or not running
    #[default]
    Cached,
}

impl UidState {
    /// Numeric value used in snapshots and logs
    pub fn value(self) -> u32 {
        match self {
            UidState::Persistent => 100,
            UidState::Top => 200,
            UidState::ForegroundServiceLocation => 300,
            UidState::ForegroundService => 400,
            UidState::Foreground => 500,
            UidState::Background => 600,
            UidState::Cached => 700,
        }
    }

    /// Whether the state counts as foreground for `Foreground` modes
    pub fn is_foreground(self) -> bool {
        self <= UidState::Foreground
    }
}

impl fmt::Display for UidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_follows_importance() {
        assert!(UidState::Top < UidState::ForegroundService);
        assert!(UidState::Background > UidState::Foreground);
        assert!(UidState::Foreground.is_foreground());
        assert!(!UidState::Cached.is_foreground());
        assert_eq!(UidState::default(), UidState::Cached);
    }
}
