//! Snapshot restore and the debounced write path

use appops_core::{
    AccessHistoryEntry, OpFlags, Result, StateSnapshot, StateStore, Timestamp, SNAPSHOT_VERSION,
};
use std::time::Duration;
use tokio::sync::watch;

use super::{AppOpsEngine, EngineState};
use crate::usage::{AccessEntry, AccessKey};

impl AppOpsEngine {
    /// Load the saved snapshot, if any, into the empty engine
    pub(super) fn restore_from_store(&self) -> Result<()> {
        let Some(store) = self.state_store.as_ref() else {
            return Ok(());
        };
        let Some(snapshot) = store.load()? else {
            tracing::info!("no saved app-ops state");
            return Ok(());
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut skipped = 0usize;
        for entry in &snapshot.uid_modes {
            if !self.catalog.contains(entry.op) {
                skipped += 1;
                continue;
            }
            state
                .modes
                .set_uid_mode(entry.uid, &entry.device, entry.op, Some(entry.mode));
        }
        for entry in &snapshot.package_modes {
            if !self.catalog.contains(entry.op) {
                skipped += 1;
                continue;
            }
            state
                .modes
                .set_package_mode(entry.user, &entry.package, entry.op, Some(entry.mode));
        }
        for entry in snapshot.history.iter().cloned() {
            if !self.catalog.contains(entry.op) {
                skipped += 1;
                continue;
            }
            let package = state.registry.restore_package(entry.uid, &entry.package);
            let Some(key) = state.registry.ensure_attribution(
                package,
                entry.op,
                &entry.device,
                entry.attribution_tag.as_ref(),
            ) else {
                continue;
            };
            if let Some(record) = state.registry.attribution_mut(key) {
                record.restore(
                    entry.kind,
                    AccessKey {
                        uid_state: entry.uid_state,
                        flags: OpFlags::from_bits_truncate(entry.flags),
                    },
                    AccessEntry {
                        time_ms: entry.time_ms,
                        duration_ms: entry.duration_ms,
                        proxy: entry.proxy,
                    },
                );
            }
        }
        tracing::info!(
            uid_modes = snapshot.uid_modes.len(),
            package_modes = snapshot.package_modes.len(),
            history = snapshot.history.len(),
            skipped,
            "app-ops state restored"
        );
        Ok(())
    }

    /// Current durable state
    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot_of(&self.state.lock())
    }

    fn snapshot_of(&self, state: &EngineState) -> StateSnapshot {
        let mut history: Vec<AccessHistoryEntry> = state
            .registry
            .attributions()
            .flat_map(|(_, record)| {
                record.history().map(move |(kind, key, entry)| AccessHistoryEntry {
                    uid: record.id.uid,
                    package: record.id.package.clone(),
                    op: record.id.op,
                    device: record.id.device.clone(),
                    attribution_tag: record.id.tag.clone(),
                    uid_state: key.uid_state,
                    flags: key.flags.bits(),
                    kind,
                    time_ms: entry.time_ms,
                    duration_ms: entry.duration_ms,
                    proxy: entry.proxy.clone(),
                })
            })
            .collect();
        history.sort_by(|a, b| {
            (a.uid, &a.package, a.op, &a.device, &a.attribution_tag, a.time_ms, a.flags)
                .cmp(&(b.uid, &b.package, b.op, &b.device, &b.attribution_tag, b.time_ms, b.flags))
        });
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            uid_modes: state.modes.all_uid_modes(),
            package_modes: state.modes.all_package_modes(),
            history,
        }
    }

    /// Whether a write is scheduled
    pub fn has_pending_write(&self) -> bool {
        self.state.lock().writes.due_at().is_some()
    }

    /// Save the snapshot if the scheduled write is due; returns whether it saved
    pub fn write_state_if_due(&self) -> Result<bool> {
        let Some(store) = self.state_store.as_ref() else {
            return Ok(false);
        };
        let now = self.clock.now();
        let snapshot = {
            let mut state = self.state.lock();
            if !state.writes.is_due(now.elapsed_ms) {
                return Ok(false);
            }
            state.writes.clear();
            self.snapshot_of(&state)
        };
        self.save(&**store, &snapshot, now)?;
        Ok(true)
    }

    /// Save the snapshot now, whatever is scheduled
    pub fn write_state_now(&self) -> Result<()> {
        let Some(store) = self.state_store.as_ref() else {
            return Ok(());
        };
        let now = self.clock.now();
        let snapshot = {
            let mut state = self.state.lock();
            state.writes.clear();
            self.snapshot_of(&state)
        };
        self.save(&**store, &snapshot, now)
    }

    fn save(&self, store: &dyn StateStore, snapshot: &StateSnapshot, now: Timestamp) -> Result<()> {
        if let Err(err) = store.save(snapshot) {
            tracing::warn!(error = %err, "app-ops state write failed, rescheduled");
            self.state.lock().writes.schedule(now.elapsed_ms);
            return Err(err);
        }
        tracing::debug!(
            uid_modes = snapshot.uid_modes.len(),
            package_modes = snapshot.package_modes.len(),
            history = snapshot.history.len(),
            "app-ops state written"
        );
        Ok(())
    }

    /// Background upkeep: settle uid states and write when due
    ///
    /// Runs every `poll` until `shutdown` flips or its sender is dropped,
    /// then flushes a pending write.
    pub async fn run_persistence(&self, poll: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.process_pending_uid_states();
                    // Failures are logged and rescheduled by `save`.
                    let _ = self.write_state_if_due();
                }
            }
        }
        if self.has_pending_write() {
            let _ = self.write_state_now();
        }
        tracing::info!("persistence loop stopped");
    }
}
