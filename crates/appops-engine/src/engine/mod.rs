//! The [`AppOpsEngine`] façade
//!
//! Every verb has the same shape: authorize the caller, resolve the subject
//! through the [`PackageResolver`] with no lock held, then take the engine
//! lock once to resolve the mode, update usage records and queue watcher
//! messages.
//!
//! ## Blocking lock usage
//!
//! One `parking_lot::Mutex` guards [`EngineState`]. Critical sections never
//! await and never call the resolver, the state store or listeners; those
//! run before the lock is taken or after it is released.

mod admin;
mod lifecycle;
mod persist;
mod queries;
mod usage;
mod watch;

pub use queries::{AttributionEntry, OpEntry, PackageOps};

use appops_core::{
    special_package, AppOpsError, AttributionFlags, AttributionTag, BypassFlags, CallerContext,
    ChainId, Clock, DeviceId, EngineConfig, Identity, ListenerId, Mode, ModeChanged, ModeStore,
    OpActiveChanged, OpCatalog, OpCode, OpInfo, OpNoted, OpStarted, OpFlags, PackageInfo,
    PackageName, PackageResolver, Privileges, Result, StartType, StateStore, SystemClock,
    Timestamp, Uid, WatchFlags,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::modes::MapModeStore;
use crate::persistence::WriteScheduler;
use crate::registry::{AttributionKey, PackageFacts, PackageRecord, Registry};
use crate::resolution::{PolicyView, Subject};
use crate::restrictions::RestrictionSets;
use crate::uid_state::UidStateTracker;
use crate::usage::event::EventPool;
use crate::usage::{AttributionId, EventSummary};
use crate::watchers::{Notification, NotificationDispatcher, NotificationQueue, Watchers};

/// One op invocation as named by a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRequest {
    /// Requested op
    pub op: OpCode,
    /// Uid performing the op
    pub uid: Uid,
    /// Package claimed by the uid
    pub package: Option<PackageName>,
    /// Attribution tag within the package
    pub attribution_tag: Option<AttributionTag>,
    /// Target device
    pub device: DeviceId,
}

impl OpRequest {
    /// Request on the default device with no tag
    pub fn new(op: OpCode, uid: Uid, package: impl Into<PackageName>) -> Self {
        Self {
            op,
            uid,
            package: Some(package.into()),
            attribution_tag: None,
            device: DeviceId::default_device(),
        }
    }

    /// Request naming no package; only valid for system subjects
    pub fn for_uid(op: OpCode, uid: Uid) -> Self {
        Self {
            op,
            uid,
            package: None,
            attribution_tag: None,
            device: DeviceId::default_device(),
        }
    }

    /// Request on behalf of `identity`
    pub fn from_identity(op: OpCode, identity: &Identity) -> Self {
        Self {
            op,
            uid: identity.uid,
            package: identity.package.clone(),
            attribution_tag: identity.attribution_tag.clone(),
            device: identity.device.clone(),
        }
    }

    /// Attach an attribution tag
    pub fn with_tag(mut self, tag: impl Into<AttributionTag>) -> Self {
        self.attribution_tag = Some(tag.into());
        self
    }

    /// Target another device
    pub fn on_device(mut self, device: impl Into<DeviceId>) -> Self {
        self.device = device.into();
        self
    }
}

/// Options of [`AppOpsEngine::start_operation`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Proxy performing the start on the subject's behalf
    pub proxy: Option<Identity>,
    /// Chain role of the usage
    pub attribution_flags: AttributionFlags,
    /// Chain the usage belongs to
    pub chain_id: Option<ChainId>,
    /// Treat a `Default` mode as allowed
    pub start_if_mode_default: bool,
}

impl StartOptions {
    /// Record `proxy` as the party performing the usage
    pub fn with_proxy(mut self, proxy: Identity) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Link the usage into `chain`
    pub fn in_chain(mut self, chain: ChainId, flags: AttributionFlags) -> Self {
        self.chain_id = Some(chain);
        self.attribution_flags = flags;
        self
    }

    /// Accept a `Default` mode
    pub fn start_if_mode_default(mut self) -> Self {
        self.start_if_mode_default = true;
        self
    }
}

/// Options of [`AppOpsEngine::start_proxy_operation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStartOptions {
    /// Only start the proxied side
    pub skip_proxy: bool,
    /// Treat a `Default` mode as allowed
    pub start_if_mode_default: bool,
    /// Chain role of the proxy's usage
    pub proxy_attribution_flags: AttributionFlags,
    /// Chain role of the proxied usage
    pub proxied_attribution_flags: AttributionFlags,
    /// Chain to join; a fresh one is allocated when absent
    pub chain_id: Option<ChainId>,
}

impl Default for ProxyStartOptions {
    fn default() -> Self {
        Self {
            skip_proxy: false,
            start_if_mode_default: false,
            proxy_attribution_flags: AttributionFlags::ACCESSOR,
            proxied_attribution_flags: AttributionFlags::RECEIVER,
            chain_id: None,
        }
    }
}

/// Options of a mode change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeChangeOptions {
    /// Device of a uid-level override
    pub device: DeviceId,
    /// Listener that made the change and must not hear about it
    pub exclude: Option<ListenerId>,
}

/// Everything the engine lock guards
pub(crate) struct EngineState {
    registry: Registry,
    modes: Box<dyn ModeStore>,
    restrictions: RestrictionSets,
    uid_states: UidStateTracker,
    watchers: Watchers,
    pool: EventPool,
    writes: WriteScheduler,
}

impl EngineState {
    fn view<'a>(&'a self, catalog: &'a OpCatalog, now: Timestamp) -> PolicyView<'a> {
        PolicyView {
            catalog,
            modes: self.modes.as_ref(),
            restrictions: &self.restrictions,
            uid_states: &self.uid_states,
            now_elapsed_ms: now.elapsed_ms,
        }
    }

    /// Record for `op` of a resolved subject, creating owners as needed
    fn attribution_for(&mut self, subject: &ResolvedSubject, op: OpCode) -> Option<AttributionKey> {
        let package = self
            .registry
            .ensure_package(subject.uid, &subject.package, &subject.facts);
        if let Some(tag) = &subject.raw_tag {
            self.registry.note_tag(package, tag);
        }
        let key = self
            .registry
            .ensure_attribution(package, op, &subject.device, subject.tag.as_ref());
        if key.is_none() {
            tracing::warn!(uid = %subject.uid, package = %subject.package, op = %op, "package record vanished");
        }
        key
    }
}

/// Subject after package resolution
#[derive(Debug, Clone)]
struct ResolvedSubject {
    uid: Uid,
    package: PackageName,
    /// Tag as the caller named it
    raw_tag: Option<AttributionTag>,
    /// Tag after validation
    tag: Option<AttributionTag>,
    device: DeviceId,
    facts: PackageFacts,
}

impl ResolvedSubject {
    fn subject(&self) -> Subject<'_> {
        Subject {
            uid: self.uid,
            package: Some(self.package.as_str()),
            tag: self.tag.as_ref(),
            device: &self.device,
            bypass: self.facts.bypass,
        }
    }
}

/// Targets of one mode-changed broadcast
struct ModeTarget<'a> {
    switch: OpCode,
    uid: Option<Uid>,
    packages: &'a [PackageName],
    device: &'a DeviceId,
}

/// Access-control and usage-accounting engine
pub struct AppOpsEngine {
    catalog: Arc<OpCatalog>,
    resolver: Arc<dyn PackageResolver>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    state_store: Option<Arc<dyn StateStore>>,
    queue: NotificationQueue,
    state: Mutex<EngineState>,
    next_chain_id: AtomicU64,
}

impl std::fmt::Debug for AppOpsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppOpsEngine")
            .field("ops", &self.catalog.len())
            .field("config", &self.config)
            .field("persistent", &self.state_store.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`AppOpsEngine`]
pub struct AppOpsEngineBuilder {
    catalog: Arc<OpCatalog>,
    resolver: Arc<dyn PackageResolver>,
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    mode_store: Option<Box<dyn ModeStore>>,
    state_store: Option<Arc<dyn StateStore>>,
}

impl AppOpsEngineBuilder {
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` instead of the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Keep overrides in `store` instead of a [`MapModeStore`]
    pub fn mode_store(mut self, store: Box<dyn ModeStore>) -> Self {
        self.mode_store = Some(store);
        self
    }

    /// Restore from and save to `store`
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Validate the configuration, restore saved state and return the engine
    /// with the dispatcher that delivers its notifications
    pub fn build(self) -> Result<(AppOpsEngine, NotificationDispatcher)> {
        self.config.validate()?;
        let (queue, dispatcher) = NotificationQueue::channel();
        let state = EngineState {
            registry: Registry::new(),
            modes: self
                .mode_store
                .unwrap_or_else(|| Box::new(MapModeStore::new())),
            restrictions: RestrictionSets::new(),
            uid_states: UidStateTracker::new(&self.config),
            watchers: Watchers::new(),
            pool: EventPool::new(self.config.event_pool_capacity),
            writes: WriteScheduler::new(self.config.write_delay_ms, self.config.fast_write_delay_ms),
        };
        let engine = AppOpsEngine {
            catalog: self.catalog,
            resolver: self.resolver,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            config: self.config,
            state_store: self.state_store,
            queue,
            state: Mutex::new(state),
            next_chain_id: AtomicU64::new(1),
        };
        engine.restore_from_store()?;
        tracing::info!(ops = engine.catalog.len(), "app-ops engine ready");
        Ok((engine, dispatcher))
    }
}

impl AppOpsEngine {
    /// Start building an engine over `catalog` and `resolver`
    pub fn builder(catalog: Arc<OpCatalog>, resolver: Arc<dyn PackageResolver>) -> AppOpsEngineBuilder {
        AppOpsEngineBuilder {
            catalog,
            resolver,
            config: EngineConfig::default(),
            clock: None,
            mode_store: None,
            state_store: None,
        }
    }

    /// The op catalog
    pub fn catalog(&self) -> &OpCatalog {
        &self.catalog
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Allocate an id for a new attribution chain
    pub fn allocate_chain_id(&self) -> ChainId {
        ChainId(self.next_chain_id.fetch_add(1, Ordering::Relaxed))
    }

    fn verify_incoming(&self, caller: &CallerContext, uid: Uid) -> Result<()> {
        if caller.uid == uid || caller.has(Privileges::UPDATE_STATS) {
            return Ok(());
        }
        Err(AppOpsError::security(format!(
            "uid {} may not act on behalf of uid {uid}",
            caller.uid
        )))
    }

    fn require(&self, caller: &CallerContext, privilege: Privileges, action: &str) -> Result<()> {
        if caller.has(privilege) {
            return Ok(());
        }
        Err(AppOpsError::security(format!(
            "uid {} lacks {privilege:?} to {action}",
            caller.uid
        )))
    }

    fn require_stats_for(&self, caller: &CallerContext, uid: Uid) -> Result<()> {
        if caller.uid == uid {
            return Ok(());
        }
        self.require(caller, Privileges::GET_STATS, "read another uid's state")
    }

    fn op_info(&self, op: OpCode) -> Result<&OpInfo> {
        self.catalog
            .get(op)
            .ok_or_else(|| AppOpsError::invalid(format!("unknown op {op}")))
    }

    fn switch_default(&self, info: &OpInfo) -> Mode {
        self.catalog
            .default_mode(info.switch)
            .unwrap_or(info.default_mode)
    }

    fn facts_for(&self, info: &PackageInfo) -> PackageFacts {
        PackageFacts {
            bypass: info.bypass,
            declared_tags: self
                .config
                .strict_attribution_tags
                .then(|| info.attribution_tags.clone()),
        }
    }

    /// Resolve the package, device and tag of a request; `None` when invalid
    fn resolve_subject(&self, request: &OpRequest) -> Option<ResolvedSubject> {
        if !self.resolver.is_device_known(&request.device) {
            tracing::debug!(uid = %request.uid, device = %request.device, "unknown device");
            return None;
        }

        let claimed = request.package.as_ref().map(PackageName::as_str);
        if let Some(name) = special_package(request.uid, claimed) {
            return Some(ResolvedSubject {
                uid: request.uid,
                package: PackageName::new(name),
                raw_tag: request.attribution_tag.clone(),
                tag: request.attribution_tag.clone(),
                device: request.device.clone(),
                facts: PackageFacts {
                    bypass: BypassFlags::SYSTEM_UID,
                    declared_tags: None,
                },
            });
        }

        let info = self.resolver.resolve(request.uid, claimed?)?;
        if info.uid != request.uid {
            tracing::debug!(uid = %request.uid, package = %info.name, owner = %info.uid, "package owned by another uid");
            return None;
        }
        let facts = self.facts_for(&info);
        let tag = match (&request.attribution_tag, &facts.declared_tags) {
            (Some(tag), Some(declared)) if !declared.contains(tag) => {
                tracing::debug!(uid = %request.uid, package = %info.name, tag = %tag, "undeclared attribution tag ignored");
                None
            }
            (tag, _) => tag.clone(),
        };
        Some(ResolvedSubject {
            uid: request.uid,
            package: info.name,
            raw_tag: request.attribution_tag.clone(),
            tag,
            device: request.device.clone(),
            facts,
        })
    }

    fn notify_mode_changed(
        &self,
        state: &EngineState,
        target: &ModeTarget<'_>,
        exclude: Option<ListenerId>,
        foreground_only: bool,
    ) {
        for matched in state.watchers.mode.matching(target.switch, target.uid) {
            if Some(matched.id) == exclude {
                continue;
            }
            if foreground_only && !matched.flags.contains(WatchFlags::FOREGROUND_CHANGES) {
                continue;
            }
            let packages: Vec<Option<PackageName>> = if target.packages.is_empty() {
                vec![None]
            } else {
                target.packages.iter().cloned().map(Some).collect()
            };
            for package in packages {
                self.queue.push(Notification::Mode {
                    id: matched.id,
                    listener: Arc::clone(&matched.listener),
                    event: ModeChanged {
                        op: target.switch,
                        uid: target.uid,
                        package,
                        device: target.device.clone(),
                    },
                });
            }
        }
    }

    fn notify_started(
        &self,
        state: &EngineState,
        id: &AttributionId,
        event: &EventSummary,
        result: Mode,
        start_type: StartType,
    ) {
        for matched in state.watchers.started.matching(id.op, Some(id.uid)) {
            self.queue.push(Notification::Started {
                id: matched.id,
                listener: matched.listener,
                event: OpStarted {
                    op: id.op,
                    uid: id.uid,
                    package: id.package.clone(),
                    attribution_tag: id.tag.clone(),
                    device: id.device.clone(),
                    flags: event.flags,
                    result,
                    start_type,
                    attribution_flags: event.attribution_flags,
                    chain_id: event.chain_id,
                },
            });
        }
    }

    fn notify_active(&self, state: &EngineState, id: &AttributionId, event: &EventSummary, active: bool) {
        for matched in state.watchers.active.matching(id.op, Some(id.uid)) {
            self.queue.push(Notification::Active {
                id: matched.id,
                listener: matched.listener,
                event: OpActiveChanged {
                    op: id.op,
                    uid: id.uid,
                    package: id.package.clone(),
                    attribution_tag: id.tag.clone(),
                    device: id.device.clone(),
                    active,
                    attribution_flags: event.attribution_flags,
                    chain_id: event.chain_id,
                },
            });
        }
    }

    fn notify_noted(
        &self,
        state: &EngineState,
        subject: &ResolvedSubject,
        op: OpCode,
        flags: OpFlags,
        result: Mode,
    ) {
        for matched in state.watchers.noted.matching(op, Some(subject.uid)) {
            self.queue.push(Notification::Noted {
                id: matched.id,
                listener: matched.listener,
                event: OpNoted {
                    op,
                    uid: subject.uid,
                    package: subject.package.clone(),
                    attribution_tag: subject.tag.clone(),
                    device: subject.device.clone(),
                    flags,
                    result,
                },
            });
        }
    }

    /// Pause or resume in-flight events of records matching `predicate`
    /// so they agree with the current resolution
    fn reconcile(
        &self,
        state: &mut EngineState,
        now: Timestamp,
        mut predicate: impl FnMut(&AttributionId) -> bool,
    ) {
        let keys = state
            .registry
            .attributions_where(|record| record.has_events() && predicate(&record.id));

        for key in keys {
            let Some(record) = state.registry.attribution(key) else {
                continue;
            };
            let Some(info) = self.catalog.get(record.id.op) else {
                continue;
            };
            let id = record.id.clone();
            let bypass = state
                .registry
                .package(id.uid, id.package.as_str())
                .map(PackageRecord::bypass)
                .unwrap_or_default();
            let subject = Subject {
                uid: id.uid,
                package: Some(id.package.as_str()),
                tag: id.tag.as_ref(),
                device: &id.device,
                bypass,
            };
            let permits = state
                .view(&self.catalog, now)
                .resolve(info, &subject, false, false)
                .permits_running();

            let Some(record) = state.registry.attribution_mut(key) else {
                continue;
            };
            if permits && record.has_paused() {
                let resumed = record.resume(now);
                for event in &resumed {
                    tracing::debug!(uid = %id.uid, package = %id.package, op = %id.op, token = %event.token, "usage resumed");
                    self.notify_started(state, &id, event, Mode::Allowed, StartType::Resumed);
                    self.notify_active(state, &id, event, true);
                }
            } else if !permits && record.is_running() {
                let paused = record.pause(now);
                for event in &paused {
                    tracing::debug!(uid = %id.uid, package = %id.package, op = %id.op, token = %event.token, "usage paused");
                    self.notify_active(state, &id, event, false);
                }
            }
        }
    }
}
