//! Attributed usage tracking
//!
//! An [`AttributedRecord`] is the finest-grained unit of state: one op used
//! by one package through one attribution tag on one device. It keeps the
//! last access and rejection per (uid state, flags) and the set of in-flight
//! events keyed by client token.
//!
//! In-flight events move between two maps:
//!
//! ```text
//! idle --start--> running --finish--> idle
//!                  |   ^
//!            pause |   | resume
//!                  v   |
//!                 paused --finish--> idle
//! ```

pub mod event;

pub use event::{EventPool, InProgressEvent, StartParams};

use appops_core::{
    AccessKind, AttributionFlags, AttributionTag, ChainId, ClientToken, DeviceId, Identity, OpCode,
    OpFlags, PackageName, Timestamp, Uid, UidState,
};
use std::collections::{BTreeMap, HashMap};

/// Identity of an attributed record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributionId {
    /// Owning uid
    pub uid: Uid,
    /// Owning package
    pub package: PackageName,
    /// Op (not canonicalised to its switch)
    pub op: OpCode,
    /// Target device
    pub device: DeviceId,
    /// Attribution tag
    pub tag: Option<AttributionTag>,
}

/// Key of the access and rejection tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessKey {
    /// Uid state at the time of the access
    pub uid_state: UidState,
    /// Proxy flags of the access
    pub flags: OpFlags,
}

/// Last access or rejection for one [`AccessKey`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    /// Wall-clock time
    pub time_ms: u64,
    /// Running duration, for started usages
    pub duration_ms: Option<u64>,
    /// Proxy of the access
    pub proxy: Option<Identity>,
}

/// Summary of an in-flight event for notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    /// Client token
    pub token: ClientToken,
    /// Proxy flags
    pub flags: OpFlags,
    /// Chain role
    pub attribution_flags: AttributionFlags,
    /// Chain id
    pub chain_id: Option<ChainId>,
}

impl From<&InProgressEvent> for EventSummary {
    fn from(event: &InProgressEvent) -> Self {
        Self {
            token: event.token,
            flags: event.flags,
            attribution_flags: event.attribution_flags,
            chain_id: event.chain_id,
        }
    }
}

/// An event closed by a bulk finish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedEvent {
    /// Summary of the event
    pub event: EventSummary,
    /// Monotonic start time
    pub start_elapsed_ms: u64,
    /// Whether the event was running (rather than paused) when closed
    pub was_running: bool,
}

/// Result of a start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new event was created
    Started,
    /// An existing event for the token was re-entered
    Nested,
}

/// Result of a finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// No event for the token
    Unknown,
    /// The event is still held by earlier starts
    Nested,
    /// The event ended
    Finished {
        /// Whether it was running rather than paused
        was_running: bool,
    },
}

/// Usage state of one (uid, package, op, device, tag)
#[derive(Debug, Clone)]
pub struct AttributedRecord {
    /// Identity of the record
    pub id: AttributionId,
    accesses: BTreeMap<AccessKey, AccessEntry>,
    rejects: BTreeMap<AccessKey, AccessEntry>,
    running: HashMap<ClientToken, InProgressEvent>,
    paused: HashMap<ClientToken, InProgressEvent>,
}

impl AttributedRecord {
    /// Record with no history
    pub fn new(id: AttributionId) -> Self {
        Self {
            id,
            accesses: BTreeMap::new(),
            rejects: BTreeMap::new(),
            running: HashMap::new(),
            paused: HashMap::new(),
        }
    }

    /// One-shot successful access
    pub fn accessed(&mut self, proxy: Option<Identity>, key: AccessKey, now: Timestamp) {
        self.accesses.insert(
            key,
            AccessEntry {
                time_ms: now.wall_ms,
                duration_ms: None,
                proxy,
            },
        );
    }

    /// Rejected access; in-flight state is untouched
    pub fn rejected(&mut self, proxy: Option<Identity>, key: AccessKey, now: Timestamp) {
        self.rejects.insert(
            key,
            AccessEntry {
                time_ms: now.wall_ms,
                duration_ms: None,
                proxy,
            },
        );
    }

    /// Start or re-enter a running event
    pub fn started(&mut self, pool: &mut EventPool, params: StartParams, now: Timestamp) -> StartOutcome {
        self.begin(pool, params, now, true)
    }

    /// Start an event that is parked until its op is permitted again
    pub fn create_paused(
        &mut self,
        pool: &mut EventPool,
        params: StartParams,
        now: Timestamp,
    ) -> StartOutcome {
        self.begin(pool, params, now, false)
    }

    fn begin(
        &mut self,
        pool: &mut EventPool,
        params: StartParams,
        now: Timestamp,
        running: bool,
    ) -> StartOutcome {
        let existing = self
            .running
            .get_mut(&params.token)
            .or_else(|| self.paused.get_mut(&params.token));
        if let Some(event) = existing {
            event.nesting += 1;
            return StartOutcome::Nested;
        }

        let token = params.token;
        let event = pool.acquire(params, now, running);
        if running {
            self.running.insert(token, event);
        } else {
            self.paused.insert(token, event);
        }
        StartOutcome::Started
    }

    /// Undo one start of `token`; the last one ends the event
    pub fn finished(&mut self, pool: &mut EventPool, token: ClientToken, now: Timestamp) -> FinishOutcome {
        let was_running = if let Some(event) = self.running.get_mut(&token) {
            event.nesting = event.nesting.saturating_sub(1);
            if event.nesting > 0 {
                return FinishOutcome::Nested;
            }
            true
        } else if let Some(event) = self.paused.get_mut(&token) {
            event.nesting = event.nesting.saturating_sub(1);
            if event.nesting > 0 {
                return FinishOutcome::Nested;
            }
            false
        } else {
            return FinishOutcome::Unknown;
        };

        let map = if was_running {
            &mut self.running
        } else {
            &mut self.paused
        };
        if let Some(event) = map.remove(&token) {
            self.close(pool, event, was_running, now);
        }
        FinishOutcome::Finished { was_running }
    }

    fn close(&mut self, pool: &mut EventPool, event: InProgressEvent, was_running: bool, now: Timestamp) {
        let duration = if was_running {
            Some(event.running_duration(now.elapsed_ms))
        } else if event.ever_ran {
            Some(event.accumulated_ms)
        } else {
            None
        };
        if let Some(duration) = duration {
            self.accesses.insert(
                AccessKey {
                    uid_state: event.uid_state,
                    flags: event.flags,
                },
                AccessEntry {
                    time_ms: event.start_ms,
                    duration_ms: Some(duration),
                    proxy: event.proxy.clone(),
                },
            );
        }
        pool.release(event);
    }

    /// Move every running event to paused, banking its running time
    pub fn pause(&mut self, now: Timestamp) -> Vec<EventSummary> {
        let mut paused = Vec::with_capacity(self.running.len());
        for (token, mut event) in self.running.drain() {
            event.accumulated_ms = event.running_duration(now.elapsed_ms);
            self.accesses.insert(
                AccessKey {
                    uid_state: event.uid_state,
                    flags: event.flags,
                },
                AccessEntry {
                    time_ms: event.start_ms,
                    duration_ms: Some(event.accumulated_ms),
                    proxy: event.proxy.clone(),
                },
            );
            paused.push(EventSummary::from(&event));
            self.paused.insert(token, event);
        }
        paused
    }

    /// Move every paused event back to running; start times and chains are kept
    pub fn resume(&mut self, now: Timestamp) -> Vec<EventSummary> {
        let mut resumed = Vec::with_capacity(self.paused.len());
        for (token, mut event) in self.paused.drain() {
            event.resumed_elapsed_ms = now.elapsed_ms;
            event.ever_ran = true;
            resumed.push(EventSummary::from(&event));
            self.running.insert(token, event);
        }
        resumed
    }

    /// End every in-flight event regardless of nesting
    pub fn finish_all(&mut self, pool: &mut EventPool, now: Timestamp) -> Vec<ClosedEvent> {
        self.finish_where(pool, now, |_| true)
    }

    /// End events of `chain` that started at or after `min_start_elapsed_ms`
    pub fn finish_chain(
        &mut self,
        pool: &mut EventPool,
        chain: ChainId,
        min_start_elapsed_ms: u64,
        now: Timestamp,
    ) -> Vec<ClosedEvent> {
        self.finish_where(pool, now, |event| {
            event.chain_id == Some(chain) && event.start_elapsed_ms >= min_start_elapsed_ms
        })
    }

    fn finish_where(
        &mut self,
        pool: &mut EventPool,
        now: Timestamp,
        predicate: impl Fn(&InProgressEvent) -> bool,
    ) -> Vec<ClosedEvent> {
        let mut closed = Vec::new();
        for was_running in [true, false] {
            let map = if was_running {
                &self.running
            } else {
                &self.paused
            };
            let mut tokens: Vec<ClientToken> = map
                .values()
                .filter(|event| predicate(event))
                .map(|event| event.token)
                .collect();
            tokens.sort();
            for token in tokens {
                let map = if was_running {
                    &mut self.running
                } else {
                    &mut self.paused
                };
                if let Some(event) = map.remove(&token) {
                    closed.push(ClosedEvent {
                        event: EventSummary::from(&event),
                        start_elapsed_ms: event.start_elapsed_ms,
                        was_running,
                    });
                    self.close(pool, event, was_running, now);
                }
            }
        }
        closed
    }

    /// Fold another record of the same op into this one
    ///
    /// Newer history wins per key; events of the same token are merged by
    /// adding their nesting counts.
    pub fn absorb(&mut self, other: AttributedRecord) {
        merge_latest(&mut self.accesses, other.accesses);
        merge_latest(&mut self.rejects, other.rejects);
        let incoming = other
            .running
            .into_iter()
            .map(|(token, event)| (token, event, true))
            .chain(other.paused.into_iter().map(|(token, event)| (token, event, false)));
        for (token, event, running) in incoming {
            let existing = self
                .running
                .get_mut(&token)
                .or_else(|| self.paused.get_mut(&token));
            match existing {
                Some(current) => current.nesting += event.nesting,
                None if running => {
                    self.running.insert(token, event);
                }
                None => {
                    self.paused.insert(token, event);
                }
            }
        }
    }

    /// Whether any event is running
    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Whether any event is paused
    pub fn has_paused(&self) -> bool {
        !self.paused.is_empty()
    }

    /// Whether any event is in flight
    pub fn has_events(&self) -> bool {
        self.is_running() || self.has_paused()
    }

    /// In-flight event of `token`, running or paused
    pub fn event(&self, token: ClientToken) -> Option<&InProgressEvent> {
        self.running.get(&token).or_else(|| self.paused.get(&token))
    }

    /// Whether `token` is running (not paused)
    pub fn is_token_running(&self, token: ClientToken) -> bool {
        self.running.contains_key(&token)
    }

    /// Nothing in flight and no recorded history
    pub fn is_prunable(&self) -> bool {
        !self.has_events() && self.accesses.is_empty() && self.rejects.is_empty()
    }

    /// Most recent access entry
    pub fn last_access(&self) -> Option<&AccessEntry> {
        self.accesses.values().max_by_key(|entry| entry.time_ms)
    }

    /// Most recent rejection entry
    pub fn last_reject(&self) -> Option<&AccessEntry> {
        self.rejects.values().max_by_key(|entry| entry.time_ms)
    }

    /// Access entry for one key
    pub fn access(&self, key: AccessKey) -> Option<&AccessEntry> {
        self.accesses.get(&key)
    }

    /// Rejection entry for one key
    pub fn reject(&self, key: AccessKey) -> Option<&AccessEntry> {
        self.rejects.get(&key)
    }

    /// Every history entry, accesses first
    pub fn history(&self) -> impl Iterator<Item = (AccessKind, &AccessKey, &AccessEntry)> {
        self.accesses
            .iter()
            .map(|(key, entry)| (AccessKind::Access, key, entry))
            .chain(
                self.rejects
                    .iter()
                    .map(|(key, entry)| (AccessKind::Reject, key, entry)),
            )
    }

    /// Put back a persisted history entry
    pub fn restore(&mut self, kind: AccessKind, key: AccessKey, entry: AccessEntry) {
        let table = match kind {
            AccessKind::Access => &mut self.accesses,
            AccessKind::Reject => &mut self.rejects,
        };
        table.insert(key, entry);
    }
}

fn merge_latest(into: &mut BTreeMap<AccessKey, AccessEntry>, from: BTreeMap<AccessKey, AccessEntry>) {
    for (key, entry) in from {
        match into.get(&key) {
            Some(existing) if existing.time_ms >= entry.time_ms => {}
            _ => {
                into.insert(key, entry);
            }
        }
    }
}
