//! Uid foreground state with settle-time hysteresis
//!
//! Becoming more important takes effect immediately. Becoming less
//! important is held back for a settle time chosen by the state being left,
//! so a uid briefly dropping out of the foreground does not flap its
//! `Foreground` modes.

use appops_core::{EngineConfig, Mode, ProcessCapabilities, Uid, UidState};
use std::collections::HashMap;

/// Effective state and capabilities of a uid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UidSnapshot {
    /// Importance bucket
    pub state: UidState,
    /// While-in-use capabilities
    pub capabilities: ProcessCapabilities,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    snapshot: UidSnapshot,
    commit_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct UidEntry {
    current: UidSnapshot,
    pending: Option<Pending>,
}

impl UidEntry {
    fn effective(&self, now_elapsed_ms: u64) -> UidSnapshot {
        match self.pending {
            Some(pending) if now_elapsed_ms >= pending.commit_at_ms => pending.snapshot,
            _ => self.current,
        }
    }
}

/// How an update was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidStateUpdate {
    /// Nothing changed
    Unchanged,
    /// Applied immediately
    Committed {
        /// Effective state before the update
        previous: UidSnapshot,
    },
    /// Held back until the settle time elapses
    Pending {
        /// Monotonic time the update takes effect
        commit_at_ms: u64,
    },
}

/// Result of [`UidStateTracker::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidStateReport {
    /// Earlier pending update that was due and got committed first
    pub settled: Option<SettledChange>,
    /// How the new report was applied
    pub update: UidStateUpdate,
}

/// A pending update that became effective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettledChange {
    /// Affected uid
    pub uid: Uid,
    /// State before
    pub previous: UidSnapshot,
    /// State after
    pub current: UidSnapshot,
}

/// Foreground state of every uid the engine was told about
#[derive(Debug)]
pub struct UidStateTracker {
    uids: HashMap<Uid, UidEntry>,
    top_settle_ms: u64,
    fg_service_settle_ms: u64,
    bg_settle_ms: u64,
}

impl UidStateTracker {
    /// Tracker using the settle times of `config`
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            uids: HashMap::new(),
            top_settle_ms: config.top_state_settle_ms,
            fg_service_settle_ms: config.fg_service_state_settle_ms,
            bg_settle_ms: config.bg_state_settle_ms,
        }
    }

    /// Record a new state for `uid`
    ///
    /// A due pending update is committed and reported before the new state
    /// is applied.
    pub fn update(
        &mut self,
        uid: Uid,
        state: UidState,
        capabilities: ProcessCapabilities,
        now_elapsed_ms: u64,
    ) -> UidStateReport {
        let settled = self.settle(uid, now_elapsed_ms);
        let entry = self.uids.entry(uid).or_default();
        let previous = entry.effective(now_elapsed_ms);
        let settle = match previous.state {
            UidState::Persistent | UidState::Top => self.top_settle_ms,
            UidState::ForegroundServiceLocation | UidState::ForegroundService => {
                self.fg_service_settle_ms
            }
            _ => self.bg_settle_ms,
        };
        let next = UidSnapshot {
            state,
            capabilities,
        };

        let update = if next == previous {
            entry.pending = None;
            UidStateUpdate::Unchanged
        } else if next.state < previous.state
            || (next.state == previous.state && next.capabilities.contains(previous.capabilities))
            || settle == 0
        {
            entry.current = next;
            entry.pending = None;
            UidStateUpdate::Committed { previous }
        } else {
            let commit_at_ms = now_elapsed_ms + settle;
            entry.pending = Some(Pending {
                snapshot: next,
                commit_at_ms,
            });
            UidStateUpdate::Pending { commit_at_ms }
        };
        UidStateReport { settled, update }
    }

    /// Commit the pending update of `uid` if it is due
    fn settle(&mut self, uid: Uid, now_elapsed_ms: u64) -> Option<SettledChange> {
        let entry = self.uids.get_mut(&uid)?;
        let pending = entry.pending?;
        if now_elapsed_ms < pending.commit_at_ms {
            return None;
        }
        let previous = entry.current;
        entry.current = pending.snapshot;
        entry.pending = None;
        Some(SettledChange {
            uid,
            previous,
            current: pending.snapshot,
        })
    }

    /// Effective state of `uid`; pending updates count once due
    pub fn effective(&self, uid: Uid, now_elapsed_ms: u64) -> UidSnapshot {
        self.uids
            .get(&uid)
            .map(|entry| entry.effective(now_elapsed_ms))
            .unwrap_or_default()
    }

    /// Make due pending updates current, reporting each
    pub fn commit_due(&mut self, now_elapsed_ms: u64) -> Vec<SettledChange> {
        let mut due: Vec<Uid> = self
            .uids
            .iter()
            .filter(|(_, entry)| {
                entry
                    .pending
                    .is_some_and(|pending| now_elapsed_ms >= pending.commit_at_ms)
            })
            .map(|(uid, _)| *uid)
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|uid| self.settle(uid, now_elapsed_ms))
            .collect()
    }

    /// Earliest monotonic time a pending update becomes due
    pub fn next_commit_at(&self) -> Option<u64> {
        self.uids
            .values()
            .filter_map(|entry| entry.pending.map(|pending| pending.commit_at_ms))
            .min()
    }

    /// Forget a uid
    pub fn remove(&mut self, uid: Uid) {
        self.uids.remove(&uid);
    }

    /// Forget every uid matching `predicate`
    pub fn remove_where(&mut self, mut predicate: impl FnMut(Uid) -> bool) {
        self.uids.retain(|uid, _| !predicate(*uid));
    }

    /// Downgrade a stored `Foreground` mode for the uid's effective state
    ///
    /// Other modes pass through unchanged.
    pub fn evaluate_mode(
        &self,
        uid: Uid,
        mode: Mode,
        required: ProcessCapabilities,
        now_elapsed_ms: u64,
    ) -> Mode {
        if mode != Mode::Foreground {
            return mode;
        }
        evaluate_foreground(self.effective(uid, now_elapsed_ms), required)
    }
}

/// Decision for a `Foreground` mode in a given state
pub fn evaluate_foreground(snapshot: UidSnapshot, required: ProcessCapabilities) -> Mode {
    match snapshot.state {
        UidState::Persistent | UidState::Top => Mode::Allowed,
        state if state.is_foreground() && snapshot.capabilities.contains(required) => Mode::Allowed,
        _ => Mode::Ignored,
    }
}
