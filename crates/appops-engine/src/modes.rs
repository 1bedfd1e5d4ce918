//! In-memory [`ModeStore`] used in production
//!
//! Overrides are stored by switch op only; the engine canonicalises before
//! calling in.

use appops_core::{
    DeviceId, Mode, ModeStore, OpCode, PackageModeEntry, PackageName, Uid, UidModeEntry, UserId,
};
use std::collections::{BTreeMap, HashMap};

/// Nested-map mode storage
#[derive(Debug, Default)]
pub struct MapModeStore {
    uid_modes: HashMap<Uid, BTreeMap<(DeviceId, OpCode), Mode>>,
    package_modes: HashMap<UserId, HashMap<PackageName, BTreeMap<OpCode, Mode>>>,
}

impl MapModeStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn replace<K: Ord>(map: &mut BTreeMap<K, Mode>, key: K, mode: Option<Mode>) -> bool {
    let previous = match mode {
        Some(mode) => map.insert(key, mode),
        None => map.remove(&key),
    };
    previous != mode
}

impl ModeStore for MapModeStore {
    fn uid_mode(&self, uid: Uid, device: &DeviceId, op: OpCode) -> Option<Mode> {
        self.uid_modes.get(&uid)?.get(&(device.clone(), op)).copied()
    }

    fn set_uid_mode(
        &mut self,
        uid: Uid,
        device: &DeviceId,
        op: OpCode,
        mode: Option<Mode>,
    ) -> bool {
        let modes = self.uid_modes.entry(uid).or_default();
        let changed = replace(modes, (device.clone(), op), mode);
        if modes.is_empty() {
            self.uid_modes.remove(&uid);
        }
        changed
    }

    fn package_mode(&self, user: UserId, package: &str, op: OpCode) -> Option<Mode> {
        self.package_modes
            .get(&user)?
            .get(package)?
            .get(&op)
            .copied()
    }

    fn set_package_mode(
        &mut self,
        user: UserId,
        package: &PackageName,
        op: OpCode,
        mode: Option<Mode>,
    ) -> bool {
        let packages = self.package_modes.entry(user).or_default();
        let modes = packages.entry(package.clone()).or_default();
        let changed = replace(modes, op, mode);
        if modes.is_empty() {
            packages.remove(package.as_str());
        }
        if packages.is_empty() {
            self.package_modes.remove(&user);
        }
        changed
    }

    fn uid_modes(&self, uid: Uid) -> Vec<UidModeEntry> {
        self.uid_modes
            .get(&uid)
            .map(|modes| {
                modes
                    .iter()
                    .map(|((device, op), mode)| UidModeEntry {
                        uid,
                        device: device.clone(),
                        op: *op,
                        mode: *mode,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn package_modes(&self, user: UserId, package: &str) -> Vec<PackageModeEntry> {
        self.package_modes
            .get(&user)
            .and_then(|packages| packages.get_key_value(package))
            .map(|(name, modes)| {
                modes
                    .iter()
                    .map(|(op, mode)| PackageModeEntry {
                        user,
                        package: name.clone(),
                        op: *op,
                        mode: *mode,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn all_uid_modes(&self) -> Vec<UidModeEntry> {
        let mut uids: Vec<Uid> = self.uid_modes.keys().copied().collect();
        uids.sort();
        uids.into_iter().flat_map(|uid| self.uid_modes(uid)).collect()
    }

    fn all_package_modes(&self) -> Vec<PackageModeEntry> {
        let mut entries: Vec<PackageModeEntry> = self
            .package_modes
            .iter()
            .flat_map(|(user, packages)| {
                packages.iter().flat_map(move |(package, modes)| {
                    modes.iter().map(move |(op, mode)| PackageModeEntry {
                        user: *user,
                        package: package.clone(),
                        op: *op,
                        mode: *mode,
                    })
                })
            })
            .collect();
        entries.sort_by(|a, b| (a.user, &a.package, a.op).cmp(&(b.user, &b.package, b.op)));
        entries
    }

    fn remove_uid(&mut self, uid: Uid) -> bool {
        self.uid_modes.remove(&uid).is_some()
    }

    fn remove_package(&mut self, user: UserId, package: &str) -> bool {
        let Some(packages) = self.package_modes.get_mut(&user) else {
            return false;
        };
        let removed = packages.remove(package).is_some();
        if packages.is_empty() {
            self.package_modes.remove(&user);
        }
        removed
    }

    fn remove_user(&mut self, user: UserId) {
        self.package_modes.remove(&user);
        self.uid_modes.retain(|uid, _| uid.user_id() != user);
    }

    fn clear(&mut self) {
        self.uid_modes.clear();
        self.package_modes.clear();
    }
}
