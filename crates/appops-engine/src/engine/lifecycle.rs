//! Package, uid, user and process lifecycle, and foreground state

use appops_core::{
    ChainId, DeviceId, Mode, PackageName, ProcessCapabilities, Timestamp, Uid, UidState, UserId,
};
use std::collections::BTreeMap;

use super::{AppOpsEngine, EngineState, ModeTarget};
use crate::registry::AttributionKey;
use crate::uid_state::UidStateUpdate;
use crate::usage::event::EventPool;
use crate::usage::{AttributedRecord, ClosedEvent};

impl AppOpsEngine {
    /// A package was installed for `uid`
    ///
    /// A leftover record from an earlier install picks up the new facts.
    pub fn package_added(&self, uid: Uid, package: &str) {
        let Some(info) = self.resolver.resolve(uid, package) else {
            tracing::debug!(uid = %uid, package, "added package does not resolve");
            return;
        };
        let facts = self.facts_for(&info);
        let refreshed = self.state.lock().registry.refresh_package(uid, package, &facts);
        tracing::info!(uid = %uid, package, refreshed, "package added");
    }

    /// A package was uninstalled from `uid`
    ///
    /// Its records and package-level overrides go away; when the uid has no
    /// packages left its uid-level overrides go too.
    pub fn package_removed(&self, uid: Uid, package: &str) {
        let uid_empty = self.resolver.packages_for_uid(uid).is_empty();
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let records = state.registry.remove_package(uid, package);
        let closed = self.close_removed(state, records, now);
        state.modes.remove_package(uid.user_id(), package);
        if uid_empty {
            state.modes.remove_uid(uid);
            state.uid_states.remove(uid);
        }
        state.writes.schedule_fast(now.elapsed_ms);
        tracing::info!(uid = %uid, package, closed, uid_empty, "package removed");
    }

    /// A package was updated; re-resolve its bypass and declared tags
    ///
    /// With strict tags, records of tags the package no longer declares are
    /// folded into its untagged records.
    pub fn package_updated(&self, uid: Uid, package: &str) {
        let Some(info) = self.resolver.resolve(uid, package) else {
            tracing::debug!(uid = %uid, package, "updated package does not resolve");
            return;
        };
        let facts = self.facts_for(&info);
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.registry.refresh_package(uid, package, &facts) {
            return;
        }
        let folded = if self.config.strict_attribution_tags {
            state.registry.fold_invalid_tags(uid, package)
        } else {
            0
        };
        if folded > 0 {
            state.writes.schedule(now.elapsed_ms);
        }
        tracing::info!(uid = %uid, package, folded, "package updated");
    }

    /// A uid went away with all of its packages
    pub fn uid_removed(&self, uid: Uid) {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let records = state.registry.remove_uid(uid);
        let closed = self.close_removed(state, records, now);
        state.modes.remove_uid(uid);
        state.uid_states.remove(uid);
        state.writes.schedule_fast(now.elapsed_ms);
        tracing::info!(uid = %uid, closed, "uid removed");
    }

    /// A user went away; drop its records, overrides and restriction scopes
    pub fn user_removed(&self, user: UserId) {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let records = state.registry.remove_user(user);
        let closed = self.close_removed(state, records, now);
        state.modes.remove_user(user);
        state.uid_states.remove_where(|uid| uid.user_id() == user);
        let ops = state.restrictions.remove_user(user);
        if !ops.is_empty() {
            self.restrictions_changed(state, now, &ops);
        }
        state.writes.schedule_fast(now.elapsed_ms);
        tracing::info!(user = %user, closed, restrictions = ops.len(), "user removed");
    }

    /// The processes of `uid` died; close everything they had in flight
    ///
    /// Every other in-flight event sharing a chain with a closed event, and
    /// started no earlier than it, is closed as well.
    pub fn process_died(&self, uid: Uid) {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut chains: BTreeMap<ChainId, u64> = BTreeMap::new();
        let keys = state
            .registry
            .attributions_where(|record| record.id.uid == uid && record.has_events());
        let mut closed = 0;
        for key in keys {
            closed += self.close_events(state, key, now, &mut chains, |record, pool| {
                record.finish_all(pool, now)
            });
        }

        let mut linked = 0;
        for (chain, start_elapsed_ms) in chains {
            let keys = state.registry.attributions_where(|record| record.has_events());
            let mut ignored = BTreeMap::new();
            for key in keys {
                linked += self.close_events(state, key, now, &mut ignored, |record, pool| {
                    record.finish_chain(pool, chain, start_elapsed_ms, now)
                });
            }
        }

        if closed + linked > 0 {
            state.writes.schedule(now.elapsed_ms);
        }
        tracing::info!(uid = %uid, closed, linked, "process died");
    }

    /// Report the importance and capabilities of `uid`
    ///
    /// Becoming more important applies at once; becoming less important
    /// waits out the settle time. Applied changes notify mode watchers
    /// registered for foreground changes and reconcile the uid's usages.
    pub fn update_uid_state(&self, uid: Uid, uid_state: UidState, capabilities: ProcessCapabilities) {
        let packages = self.resolver.packages_for_uid(uid);
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let report = state
            .uid_states
            .update(uid, uid_state, capabilities, now.elapsed_ms);
        if let Some(change) = report.settled {
            tracing::debug!(uid = %uid, from = ?change.previous.state, to = ?change.current.state, "uid state settled");
            self.foreground_changed(state, uid, &packages, now);
        }
        match report.update {
            UidStateUpdate::Unchanged => {}
            UidStateUpdate::Committed { previous } => {
                tracing::debug!(uid = %uid, from = ?previous.state, to = ?uid_state, "uid state changed");
                self.foreground_changed(state, uid, &packages, now);
            }
            UidStateUpdate::Pending { commit_at_ms } => {
                tracing::debug!(uid = %uid, to = ?uid_state, commit_at_ms, "uid state change pending");
            }
        }
    }

    /// Apply uid state changes whose settle time has elapsed; returns how many
    pub fn process_pending_uid_states(&self) -> usize {
        let now = self.clock.now();
        let settled = self.state.lock().uid_states.commit_due(now.elapsed_ms);
        if settled.is_empty() {
            return 0;
        }
        let packages: Vec<(Uid, Vec<PackageName>)> = settled
            .iter()
            .map(|change| (change.uid, self.resolver.packages_for_uid(change.uid)))
            .collect();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        for (change, (uid, packages)) in settled.iter().zip(&packages) {
            tracing::debug!(uid = %uid, from = ?change.previous.state, to = ?change.current.state, "uid state settled");
            self.foreground_changed(state, *uid, packages, now);
        }
        settled.len()
    }

    /// Earliest monotonic time a pending uid state change settles
    pub fn next_uid_state_commit(&self) -> Option<u64> {
        self.state.lock().uid_states.next_commit_at()
    }

    fn foreground_changed(&self, state: &mut EngineState, uid: Uid, packages: &[PackageName], now: Timestamp) {
        for entry in state.modes.uid_modes(uid) {
            if entry.mode != Mode::Foreground {
                continue;
            }
            let target = ModeTarget {
                switch: entry.op,
                uid: Some(uid),
                packages,
                device: &entry.device,
            };
            self.notify_mode_changed(state, &target, None, true);
        }

        let device = DeviceId::default_device();
        for package in packages {
            for entry in state.modes.package_modes(uid.user_id(), package.as_str()) {
                if entry.mode != Mode::Foreground {
                    continue;
                }
                let target = ModeTarget {
                    switch: entry.op,
                    uid: Some(uid),
                    packages: std::slice::from_ref(package),
                    device: &device,
                };
                self.notify_mode_changed(state, &target, None, true);
            }
        }

        self.reconcile(state, now, |id| id.uid == uid);
    }

    /// Close events of removed records; returns how many were closed
    fn close_removed(&self, state: &mut EngineState, records: Vec<AttributedRecord>, now: Timestamp) -> usize {
        let mut count = 0;
        for mut record in records {
            let closed = record.finish_all(&mut state.pool, now);
            for event in closed.iter().filter(|event| event.was_running) {
                self.notify_active(state, &record.id, &event.event, false);
            }
            count += closed.len();
        }
        count
    }

    /// Close events of one record, noting the earliest start of each chain
    fn close_events(
        &self,
        state: &mut EngineState,
        key: AttributionKey,
        now: Timestamp,
        chains: &mut BTreeMap<ChainId, u64>,
        close: impl FnOnce(&mut AttributedRecord, &mut EventPool) -> Vec<ClosedEvent>,
    ) -> usize {
        let Some(record) = state.registry.attribution_mut(key) else {
            return 0;
        };
        let closed = close(record, &mut state.pool);
        if closed.is_empty() {
            return 0;
        }
        let id = record.id.clone();
        for event in &closed {
            if event.was_running {
                self.notify_active(state, &id, &event.event, false);
            }
            if let Some(chain) = event.event.chain_id {
                chains
                    .entry(chain)
                    .and_modify(|start| *start = (*start).min(event.start_elapsed_ms))
                    .or_insert(event.start_elapsed_ms);
            }
        }
        state.registry.prune(key);
        closed.len()
    }
}
