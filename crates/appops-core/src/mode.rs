//! Decision modes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::AppOpsError;

/// Outcome of resolving an op for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// The op may proceed
    Allowed,
    /// The op is silently denied
    Ignored,
    /// The op is denied and the caller should fail loudly
    Errored,
    /// No explicit decision; the caller applies its own policy
    Default,
    /// Allowed only while the uid is in the foreground
    Foreground,
}

impl Mode {
    /// All modes, in wire order
    pub const ALL: [Mode; 5] = [
        Mode::Allowed,
        Mode::Ignored,
        Mode::Errored,
        Mode::Default,
        Mode::Foreground,
    ];

    /// Lower-case name used in config and snapshots
    pub fn name(self) -> &'static str {
        match self {
            Mode::Allowed => "allowed",
            Mode::Ignored => "ignored",
            Mode::Errored => "errored",
            Mode::Default => "default",
            Mode::Foreground => "foreground",
        }
    }

    /// Whether the op may proceed
    pub fn is_allowed(self) -> bool {
        self == Mode::Allowed
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = AppOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| AppOpsError::invalid(format!("unknown mode '{s}'")))
    }
}
