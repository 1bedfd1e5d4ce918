//! Storage seams: mode overrides and durable snapshots.
//!
//! Mode storage is a strategy: the engine talks to [`ModeStore`] and never
//! to a concrete schema. Durable state is exchanged as a versioned
//! [`StateSnapshot`] through a [`StateStore`].

use serde::{Deserialize, Serialize};

use crate::errors::{AppOpsError, Result};
use crate::identity::Identity;
use crate::ids::{AttributionTag, DeviceId, OpCode, PackageName, Uid, UserId};
use crate::mode::Mode;
use crate::uid_state::UidState;

/// Current snapshot schema
pub const SNAPSHOT_VERSION: u32 = 2;

/// A stored uid-level override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidModeEntry {
    /// Subject
    pub uid: Uid,
    /// Device the override applies to (absent in version 1 snapshots)
    #[serde(default)]
    pub device: DeviceId,
    /// Switch op
    pub op: OpCode,
    /// Stored mode
    pub mode: Mode,
}

/// A stored package-level override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageModeEntry {
    /// User the package is installed for
    pub user: UserId,
    /// Package
    pub package: PackageName,
    /// Switch op
    pub op: OpCode,
    /// Stored mode
    pub mode: Mode,
}

/// Mode override storage
pub trait ModeStore: Send {
    /// Uid-level override of a switch op on a device
    fn uid_mode(&self, uid: Uid, device: &DeviceId, op: OpCode) -> Option<Mode>;

    /// Store (`Some`) or clear (`None`) a uid-level override; returns whether anything changed
    fn set_uid_mode(&mut self, uid: Uid, device: &DeviceId, op: OpCode, mode: Option<Mode>)
        -> bool;

    /// Package-level override of a switch op
    fn package_mode(&self, user: UserId, package: &str, op: OpCode) -> Option<Mode>;

    /// Store (`Some`) or clear (`None`) a package-level override; returns whether anything changed
    fn set_package_mode(
        &mut self,
        user: UserId,
        package: &PackageName,
        op: OpCode,
        mode: Option<Mode>,
    ) -> bool;

    /// All uid-level overrides of `uid`
    fn uid_modes(&self, uid: Uid) -> Vec<UidModeEntry>;

    /// All package-level overrides of `package` for `user`
    fn package_modes(&self, user: UserId, package: &str) -> Vec<PackageModeEntry>;

    /// Every uid-level override
    fn all_uid_modes(&self) -> Vec<UidModeEntry>;

    /// Every package-level override
    fn all_package_modes(&self) -> Vec<PackageModeEntry>;

    /// Drop every override of `uid`; returns whether anything was stored
    fn remove_uid(&mut self, uid: Uid) -> bool;

    /// Drop every override of `package` for `user`; returns whether anything was stored
    fn remove_package(&mut self, user: UserId, package: &str) -> bool;

    /// Drop every override belonging to `user`
    fn remove_user(&mut self, user: UserId);

    /// Drop everything
    fn clear(&mut self);
}

/// Whether a history entry records an access or a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    /// The op was performed
    Access,
    /// The op was denied
    Reject,
}

/// One persisted usage history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessHistoryEntry {
    /// Subject
    pub uid: Uid,
    /// Package
    pub package: PackageName,
    /// Op (not canonicalised)
    pub op: OpCode,
    /// Device
    #[serde(default)]
    pub device: DeviceId,
    /// Attribution tag
    pub attribution_tag: Option<AttributionTag>,
    /// Uid state at the time of the access
    pub uid_state: UidState,
    /// Raw `OpFlags` bits
    pub flags: u32,
    /// Access or rejection
    pub kind: AccessKind,
    /// Wall-clock time of the access
    pub time_ms: u64,
    /// Duration of the access, when it was a started usage
    pub duration_ms: Option<u64>,
    /// Proxy that performed the access
    pub proxy: Option<Identity>,
}

/// Durable engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Schema version
    pub version: u32,
    /// Uid-level overrides
    #[serde(default)]
    pub uid_modes: Vec<UidModeEntry>,
    /// Package-level overrides
    #[serde(default)]
    pub package_modes: Vec<PackageModeEntry>,
    /// Usage history
    #[serde(default)]
    pub history: Vec<AccessHistoryEntry>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            uid_modes: Vec::new(),
            package_modes: Vec::new(),
            history: Vec::new(),
        }
    }
}

impl StateSnapshot {
    /// Bring an older snapshot to the current schema
    ///
    /// Version 1 stored uid modes without device ids; serde already filled
    /// in the default device, so only the version needs bumping.
    pub fn upgrade(mut self) -> Result<Self> {
        match self.version {
            SNAPSHOT_VERSION => Ok(self),
            1 => {
                tracing::info!(
                    from = self.version,
                    to = SNAPSHOT_VERSION,
                    "upgrading state snapshot"
                );
                self.version = SNAPSHOT_VERSION;
                Ok(self)
            }
            other => Err(AppOpsError::storage(format!(
                "unsupported snapshot version {other}"
            ))),
        }
    }
}

/// Durable home of [`StateSnapshot`]s
pub trait StateStore: Send + Sync {
    /// Read the last saved snapshot, if any
    fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Replace the saved snapshot
    fn save(&self, snapshot: &StateSnapshot) -> Result<()>;
}
