//! Mode overrides and restrictions

use appops_core::{
    AppOpsError, CallerContext, DeviceId, Mode, OpCode, PackageModeEntry, PackageName, Privileges,
    RestrictionToken, Result, Timestamp, Uid, UidModeEntry, UserId,
};
use std::collections::{BTreeMap, BTreeSet};

use super::{AppOpsEngine, EngineState, ModeChangeOptions, ModeTarget};
use crate::restrictions::{PackageTagsList, UserScope};

impl AppOpsEngine {
    /// Set the uid-level mode of `op`'s switch on the default device
    pub fn set_uid_mode(&self, caller: &CallerContext, uid: Uid, op: OpCode, mode: Mode) -> Result<()> {
        self.set_uid_mode_with(caller, uid, op, mode, &ModeChangeOptions::default())
    }

    /// Set the uid-level mode of `op`'s switch
    ///
    /// A mode equal to the switch default clears the override.
    pub fn set_uid_mode_with(
        &self,
        caller: &CallerContext,
        uid: Uid,
        op: OpCode,
        mode: Mode,
        options: &ModeChangeOptions,
    ) -> Result<()> {
        self.require(caller, Privileges::MANAGE_MODES, "change modes")?;
        let info = self.op_info(op)?;
        let switch = info.switch;
        let stored = (mode != self.switch_default(info)).then_some(mode);
        let packages = self.resolver.packages_for_uid(uid);

        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.modes.set_uid_mode(uid, &options.device, switch, stored) {
            return Ok(());
        }
        tracing::info!(uid = %uid, op = %switch, %mode, device = %options.device, "uid mode changed");

        let target = ModeTarget {
            switch,
            uid: Some(uid),
            packages: &packages,
            device: &options.device,
        };
        self.notify_mode_changed(state, &target, options.exclude, false);
        let members = self.catalog.ops_sharing_switch(switch);
        self.reconcile(state, now, |id| id.uid == uid && members.contains(&id.op));
        state.writes.schedule_fast(now.elapsed_ms);
        Ok(())
    }

    /// Set the package-level mode of `op`'s switch
    pub fn set_package_mode(
        &self,
        caller: &CallerContext,
        uid: Uid,
        package: &str,
        op: OpCode,
        mode: Mode,
    ) -> Result<()> {
        self.set_package_mode_with(caller, uid, package, op, mode, &ModeChangeOptions::default())
    }

    /// Set the package-level mode of `op`'s switch
    ///
    /// The package must be installed under `uid`. A mode equal to the
    /// switch default clears the override.
    pub fn set_package_mode_with(
        &self,
        caller: &CallerContext,
        uid: Uid,
        package: &str,
        op: OpCode,
        mode: Mode,
        options: &ModeChangeOptions,
    ) -> Result<()> {
        self.require(caller, Privileges::MANAGE_MODES, "change modes")?;
        let info = self.op_info(op)?;
        let switch = info.switch;
        let stored = (mode != self.switch_default(info)).then_some(mode);
        let Some(resolved) = self.resolver.resolve(uid, package) else {
            return Err(AppOpsError::invalid(format!(
                "package {package} is not installed for uid {uid}"
            )));
        };
        let name = resolved.name;

        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.modes.set_package_mode(uid.user_id(), &name, switch, stored) {
            return Ok(());
        }
        tracing::info!(uid = %uid, package = %name, op = %switch, %mode, "package mode changed");

        let packages = [name.clone()];
        let device = DeviceId::default_device();
        let target = ModeTarget {
            switch,
            uid: Some(uid),
            packages: &packages,
            device: &device,
        };
        self.notify_mode_changed(state, &target, options.exclude, false);
        let members = self.catalog.ops_sharing_switch(switch);
        self.reconcile(state, now, |id| {
            id.uid == uid && id.package == name && members.contains(&id.op)
        });
        state.writes.schedule_fast(now.elapsed_ms);
        Ok(())
    }

    /// Clear resettable overrides, optionally narrowed to a user and a package
    ///
    /// Ops marked as not resettable keep their overrides.
    pub fn reset_all_modes(
        &self,
        caller: &CallerContext,
        user: Option<UserId>,
        package: Option<&str>,
    ) -> Result<()> {
        self.require(caller, Privileges::MANAGE_MODES, "reset modes")?;
        let resettable = |op: OpCode| self.catalog.get(op).is_some_and(|info| info.allow_reset);
        let in_user = |candidate: UserId| user.map_or(true, |user| user == candidate);

        // Collect candidates under the lock, filter them with the resolver
        // outside it, then clear what is still stored.
        let (uid_entries, package_entries) = {
            let state = self.state.lock();
            (state.modes.all_uid_modes(), state.modes.all_package_modes())
        };
        let uid_entries: Vec<UidModeEntry> = uid_entries
            .into_iter()
            .filter(|entry| resettable(entry.op) && in_user(entry.uid.user_id()))
            .filter(|entry| {
                package.map_or(true, |package| {
                    self.resolver.uid_for_package(entry.uid.user_id(), package) == Some(entry.uid)
                })
            })
            .collect();
        let package_entries: Vec<(PackageModeEntry, Option<Uid>)> = package_entries
            .into_iter()
            .filter(|entry| resettable(entry.op) && in_user(entry.user))
            .filter(|entry| package.map_or(true, |package| entry.package.as_str() == package))
            .map(|entry| {
                let uid = self.resolver.uid_for_package(entry.user, entry.package.as_str());
                (entry, uid)
            })
            .collect();
        if uid_entries.is_empty() && package_entries.is_empty() {
            return Ok(());
        }
        let uid_packages: BTreeMap<Uid, Vec<PackageName>> = uid_entries
            .iter()
            .map(|entry| (entry.uid, self.resolver.packages_for_uid(entry.uid)))
            .collect();

        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut affected: BTreeSet<Uid> = BTreeSet::new();
        let mut cleared = 0usize;

        for entry in &uid_entries {
            if !state.modes.set_uid_mode(entry.uid, &entry.device, entry.op, None) {
                continue;
            }
            cleared += 1;
            affected.insert(entry.uid);
            let packages = uid_packages.get(&entry.uid).map(Vec::as_slice).unwrap_or(&[]);
            let target = ModeTarget {
                switch: entry.op,
                uid: Some(entry.uid),
                packages,
                device: &entry.device,
            };
            self.notify_mode_changed(state, &target, None, false);
        }

        let device = DeviceId::default_device();
        for (entry, uid) in &package_entries {
            if !state
                .modes
                .set_package_mode(entry.user, &entry.package, entry.op, None)
            {
                continue;
            }
            cleared += 1;
            let Some(uid) = *uid else {
                continue;
            };
            affected.insert(uid);
            let packages = [entry.package.clone()];
            let target = ModeTarget {
                switch: entry.op,
                uid: Some(uid),
                packages: &packages,
                device: &device,
            };
            self.notify_mode_changed(state, &target, None, false);
        }

        self.reconcile(state, now, |id| affected.contains(&id.uid));
        if cleared > 0 {
            state.writes.schedule_fast(now.elapsed_ms);
        }
        tracing::info!(user = ?user, package = ?package, cleared, "modes reset");
        Ok(())
    }

    /// Restrict or lift `op` for a user scope under `token`
    ///
    /// Packages (and tags) listed in `exclusions` stay unrestricted.
    pub fn set_user_restriction(
        &self,
        caller: &CallerContext,
        token: RestrictionToken,
        op: OpCode,
        restricted: bool,
        exclusions: Option<PackageTagsList>,
        scope: UserScope,
    ) -> Result<()> {
        self.require(caller, Privileges::MANAGE_RESTRICTIONS, "change restrictions")?;
        self.op_info(op)?;
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state
            .restrictions
            .set_user(token, op, restricted, exclusions, scope)
        {
            return Ok(());
        }
        tracing::info!(token = %token, op = %op, restricted, scope = ?scope, "user restriction changed");
        self.restrictions_changed(state, now, &[op]);
        Ok(())
    }

    /// Restrict or lift `op` for every user under `token`, with no exclusions
    pub fn set_global_restriction(
        &self,
        caller: &CallerContext,
        token: RestrictionToken,
        op: OpCode,
        restricted: bool,
    ) -> Result<()> {
        self.require(caller, Privileges::MANAGE_RESTRICTIONS, "change restrictions")?;
        self.op_info(op)?;
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.restrictions.set_global(token, op, restricted) {
            return Ok(());
        }
        tracing::info!(token = %token, op = %op, restricted, "global restriction changed");
        self.restrictions_changed(state, now, &[op]);
        Ok(())
    }

    /// Drop every restriction installed under `token`
    pub fn remove_restriction_token(&self, caller: &CallerContext, token: RestrictionToken) -> Result<()> {
        self.require(caller, Privileges::MANAGE_RESTRICTIONS, "change restrictions")?;
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ops = state.restrictions.remove_token(token);
        if ops.is_empty() {
            return Ok(());
        }
        tracing::info!(token = %token, ops = ops.len(), "restriction token removed");
        self.restrictions_changed(state, now, &ops);
        Ok(())
    }

    /// Broadcast restriction changes for `ops` and reconcile their in-flight events
    pub(super) fn restrictions_changed(&self, state: &mut EngineState, now: Timestamp, ops: &[OpCode]) {
        let device = DeviceId::default_device();
        let switches: BTreeSet<OpCode> = ops
            .iter()
            .map(|op| self.catalog.switch_of(*op).unwrap_or(*op))
            .collect();
        for switch in switches {
            let target = ModeTarget {
                switch,
                uid: None,
                packages: &[],
                device: &device,
            };
            self.notify_mode_changed(state, &target, None, false);
        }
        self.reconcile(state, now, |id| ops.contains(&id.op));
    }
}
