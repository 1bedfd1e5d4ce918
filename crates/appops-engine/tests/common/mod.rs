//! Shared setup for the engine integration suites

#![allow(dead_code, clippy::expect_used)]

use appops_core::{CallerContext, EngineConfig, StateStore, Uid};
use appops_engine::{AppOpsEngine, NotificationDispatcher};
use appops_testkit::{init_test_tracing, standard_resolver, test_catalog, ManualClock, StaticPackageResolver};
use std::sync::Arc;

/// Engine under test with handles on its collaborators
pub struct Harness {
    pub engine: AppOpsEngine,
    pub dispatcher: NotificationDispatcher,
    pub clock: ManualClock,
    pub resolver: Arc<StaticPackageResolver>,
}

impl Harness {
    /// Deliver every queued notification
    pub fn flush(&mut self) -> usize {
        self.dispatcher.dispatch_pending()
    }
}

/// Engine over the fixture catalog and packages with default config
pub fn harness() -> Harness {
    harness_with(EngineConfig::default(), None)
}

/// Engine with `config` and an optional state store
pub fn harness_with(config: EngineConfig, store: Option<Arc<dyn StateStore>>) -> Harness {
    init_test_tracing();
    let clock = ManualClock::new(1_000);
    let resolver = Arc::new(standard_resolver());
    let mut builder = AppOpsEngine::builder(test_catalog(), resolver.clone())
        .config(config)
        .clock(Arc::new(clock.clone()));
    if let Some(store) = store {
        builder = builder.state_store(store);
    }
    let (engine, dispatcher) = builder.build().expect("engine builds");
    Harness {
        engine,
        dispatcher,
        clock,
        resolver,
    }
}

/// Privileged caller acting for everyone
pub fn system() -> CallerContext {
    CallerContext::system()
}

/// Unprivileged caller acting as `uid`
pub fn app(uid: Uid) -> CallerContext {
    CallerContext::app(uid)
}
