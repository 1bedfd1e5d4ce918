//! App-ops Testing Infrastructure
//!
//! Deterministic collaborators for engine tests: a package resolver backed
//! by a static table, a manually advanced clock, watchers that record every
//! event they receive, a mode store that logs its calls, and a fixture
//! catalog with the ops used throughout the test suites.
//!
//! # Usage
//!
//! ```rust,no_run
//! use appops_testkit::*;
//!
//! let resolver = standard_resolver();
//! let clock = ManualClock::new(1_000);
//! clock.advance_ms(250);
//! assert!(resolver.uid_for_package(appops_core::UserId::SYSTEM, CAM_PACKAGE).is_some());
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod clock;
pub mod fixtures;
pub mod mode_store;
pub mod resolver;
pub mod watchers;

pub use clock::ManualClock;
pub use fixtures::*;
pub use mode_store::{RecordingModeStore, StoreCall};
pub use resolver::StaticPackageResolver;
pub use watchers::{PanickingWatcher, RecordedEvent, RecordingWatcher};

// Re-exported so test binaries only need the testkit for setup
pub use appops_core::PackageResolver;

/// Install a `tracing` subscriber for test output
///
/// Safe to call from every test; only the first call installs anything.
/// Honours `RUST_LOG`, defaulting to `debug` for the app-ops crates.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("appops_engine=debug,info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
