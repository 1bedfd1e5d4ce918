//! App-ops Engine - runtime access control and usage accounting
//!
//! Decides whether an app may perform a sensitive operation, records every
//! access and rejection, tracks in-flight usages (with pause and resume as
//! policy changes under them) and tells registered watchers about it.
//!
//! The layers, bottom up:
//!
//! - [`registry`]: arena-backed uid → package → op → device → tag records
//! - [`usage`]: per-record access history and in-flight events
//! - [`modes`], [`restrictions`], [`uid_state`]: the inputs of a decision
//! - [`resolution`]: combines them into one mode
//! - [`watchers`]: listener tables and the delivery queue
//! - [`persistence`]: snapshot stores and the debounced write schedule
//! - [`engine`]: the [`AppOpsEngine`] façade every caller goes through
//!
//! # Usage
//!
//! ```rust,no_run
//! use appops_core::{CallerContext, Mode, OpCatalog, PackageResolver};
//! use appops_engine::{AppOpsEngine, OpRequest};
//! use std::sync::Arc;
//!
//! # fn demo(catalog: Arc<OpCatalog>, resolver: Arc<dyn PackageResolver>) -> appops_core::Result<()> {
//! let (engine, dispatcher) = AppOpsEngine::builder(catalog, resolver).build()?;
//! tokio::spawn(dispatcher.run());
//!
//! let camera = appops_core::OpCode(26);
//! let caller = CallerContext::system();
//! let request = OpRequest::new(camera, appops_core::Uid(10_100), "cam.app");
//! if engine.check_operation(&caller, &request, false)? == Mode::Allowed {
//!     // open the camera
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

/// The engine façade
pub mod engine;

/// Default in-memory mode override store
pub mod modes;

/// State stores and write scheduling
pub mod persistence;

/// Usage record registry
pub mod registry;

/// Mode resolution
pub mod resolution;

/// User and global restrictions
pub mod restrictions;

/// Uid importance tracking with settle times
pub mod uid_state;

/// Access history and in-flight events
pub mod usage;

/// Listener tables and delivery
pub mod watchers;

pub use engine::{
    AppOpsEngine, AppOpsEngineBuilder, AttributionEntry, ModeChangeOptions, OpEntry, OpRequest,
    PackageOps, ProxyStartOptions, StartOptions,
};
pub use modes::MapModeStore;
pub use persistence::{JsonFileStateStore, MemoryStateStore, WriteScheduler};
pub use restrictions::{PackageTagsList, UserScope};
pub use watchers::{NotificationDispatcher, OpFilter};
