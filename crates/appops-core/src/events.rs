//! Watcher events and listener traits
//!
//! Listeners are invoked from the engine's single delivery queue, never
//! while the engine lock is held. A panicking listener only loses the
//! message being delivered.

use crate::flags::{AttributionFlags, OpFlags};
use crate::ids::{AttributionTag, ChainId, DeviceId, OpCode, PackageName, Uid};
use crate::mode::Mode;

/// The stored or effective mode of an op may have changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChanged {
    /// Switch op whose mode changed
    pub op: OpCode,
    /// Affected uid; `None` when every uid may be affected
    pub uid: Option<Uid>,
    /// Affected package; `None` for uid-wide or system-wide changes
    pub package: Option<PackageName>,
    /// Device the change applies to
    pub device: DeviceId,
}

/// Kind of a usage-started notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartType {
    /// A start was accepted
    Started,
    /// A start was rejected or parked as paused
    Failed,
    /// A paused event was resumed
    Resumed,
}

/// An op was started (or failed to start, or resumed)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpStarted {
    /// Started op
    pub op: OpCode,
    /// Uid performing the op
    pub uid: Uid,
    /// Package performing the op
    pub package: PackageName,
    /// Attribution tag of the usage
    pub attribution_tag: Option<AttributionTag>,
    /// Target device
    pub device: DeviceId,
    /// Proxy flags of the start
    pub flags: OpFlags,
    /// Decision returned to the caller
    pub result: Mode,
    /// Kind of start
    pub start_type: StartType,
    /// Chain role of the usage
    pub attribution_flags: AttributionFlags,
    /// Chain the usage belongs to
    pub chain_id: Option<ChainId>,
}

/// An op began or stopped being in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpActiveChanged {
    /// Affected op
    pub op: OpCode,
    /// Uid performing the op
    pub uid: Uid,
    /// Package performing the op
    pub package: PackageName,
    /// Attribution tag of the usage
    pub attribution_tag: Option<AttributionTag>,
    /// Target device
    pub device: DeviceId,
    /// Whether the usage is now running
    pub active: bool,
    /// Chain role of the usage
    pub attribution_flags: AttributionFlags,
    /// Chain the usage belongs to
    pub chain_id: Option<ChainId>,
}

/// A one-shot access decision was made
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpNoted {
    /// Noted op
    pub op: OpCode,
    /// Uid performing the op
    pub uid: Uid,
    /// Package performing the op
    pub package: PackageName,
    /// Attribution tag of the access
    pub attribution_tag: Option<AttributionTag>,
    /// Target device
    pub device: DeviceId,
    /// Proxy flags of the access
    pub flags: OpFlags,
    /// Decision returned to the caller
    pub result: Mode,
}

/// Listener for mode changes
pub trait ModeWatcher: Send + Sync {
    /// Called once per affected uid/package
    fn on_mode_changed(&self, event: &ModeChanged);
}

/// Listener for usage starts
pub trait StartedWatcher: Send + Sync {
    /// Called for every start attempt and resume
    fn on_op_started(&self, event: &OpStarted);
}

/// Listener for in-progress transitions
pub trait ActiveWatcher: Send + Sync {
    /// Called when an in-flight event starts, pauses, resumes or finishes
    fn on_active_changed(&self, event: &OpActiveChanged);
}

/// Listener for one-shot decisions
pub trait NotedWatcher: Send + Sync {
    /// Called for every note decision
    fn on_op_noted(&self, event: &OpNoted);
}
