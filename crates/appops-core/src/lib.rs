//! App-ops Core - shared vocabulary of the access-control engine
//!
//! Identifiers, decision modes, flag sets, the static op catalog, engine
//! configuration, and the collaborator traits the engine consumes:
//!
//! - [`PackageResolver`]: package-manager lookups
//! - [`Clock`]: wall and monotonic time
//! - [`ModeStore`] / [`StateStore`]: override storage and durable snapshots
//! - [`ModeWatcher`], [`StartedWatcher`], [`ActiveWatcher`], [`NotedWatcher`]:
//!   listener traits fed by the engine's delivery queue

#![forbid(unsafe_code)]

/// Static op catalog
pub mod catalog;

/// Time source
pub mod clock;

/// Engine configuration
pub mod config;

/// Unified error handling
pub mod errors;

/// Watcher events and listener traits
pub mod events;

/// Bit flag sets
pub mod flags;

/// Caller identities and package resolution
pub mod identity;

/// Identifiers
pub mod ids;

/// Decision modes
pub mod mode;

/// Storage traits and snapshots
pub mod store;

/// Uid importance states
pub mod uid_state;

pub use catalog::{OpCatalog, OpCatalogBuilder, OpInfo};
pub use clock::{Clock, SystemClock, Timestamp};
pub use config::EngineConfig;
pub use errors::{AppOpsError, Result};
pub use events::{
    ActiveWatcher, ModeChanged, ModeWatcher, NotedWatcher, OpActiveChanged, OpNoted, OpStarted,
    StartType, StartedWatcher,
};
pub use flags::{
    AttributionFlags, BypassFlags, OpFlags, Privileges, ProcessCapabilities, WatchFlags,
};
pub use identity::{
    is_always_allowed, special_package, CallerContext, Identity, PackageInfo, PackageResolver,
};
pub use ids::{
    AttributionTag, ChainId, ClientToken, ConnectionId, DeviceId, ListenerId, OpCode, PackageName,
    RestrictionToken, Uid, UserId, DEFAULT_DEVICE, PER_USER_RANGE,
};
pub use mode::Mode;
pub use store::{
    AccessHistoryEntry, AccessKind, ModeStore, PackageModeEntry, StateSnapshot, StateStore,
    UidModeEntry, SNAPSHOT_VERSION,
};
pub use uid_state::UidState;
