//! In-memory mode store that logs every mutation

use appops_core::{
    DeviceId, Mode, ModeStore, OpCode, PackageModeEntry, PackageName, Uid, UidModeEntry, UserId,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A mutation observed by [`RecordingModeStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// `set_uid_mode`
    SetUid {
        /// Subject
        uid: Uid,
        /// Op
        op: OpCode,
        /// New value
        mode: Option<Mode>,
    },
    /// `set_package_mode`
    SetPackage {
        /// Package
        package: PackageName,
        /// Op
        op: OpCode,
        /// New value
        mode: Option<Mode>,
    },
    /// `remove_uid`
    RemoveUid(Uid),
    /// `remove_package`
    RemovePackage(PackageName),
    /// `remove_user`
    RemoveUser(UserId),
    /// `clear`
    Clear,
}

#[derive(Debug, Default)]
struct Inner {
    uid_modes: BTreeMap<(Uid, DeviceId, OpCode), Mode>,
    package_modes: BTreeMap<(UserId, PackageName, OpCode), Mode>,
    calls: Vec<StoreCall>,
}

/// Mode store whose clones share state, so tests can inspect what the
/// engine wrote
#[derive(Debug, Clone, Default)]
pub struct RecordingModeStore {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingModeStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutations in call order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().calls.clone()
    }

    /// Forget recorded calls, keeping stored modes
    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }
}

impl ModeStore for RecordingModeStore {
    fn uid_mode(&self, uid: Uid, device: &DeviceId, op: OpCode) -> Option<Mode> {
        self.inner
            .lock()
            .uid_modes
            .get(&(uid, device.clone(), op))
            .copied()
    }

    fn set_uid_mode(
        &mut self,
        uid: Uid,
        device: &DeviceId,
        op: OpCode,
        mode: Option<Mode>,
    ) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::SetUid { uid, op, mode });
        let key = (uid, device.clone(), op);
        let previous = match mode {
            Some(mode) => inner.uid_modes.insert(key, mode),
            None => inner.uid_modes.remove(&key),
        };
        previous != mode
    }

    fn package_mode(&self, user: UserId, package: &str, op: OpCode) -> Option<Mode> {
        self.inner
            .lock()
            .package_modes
            .get(&(user, PackageName::new(package), op))
            .copied()
    }

    fn set_package_mode(
        &mut self,
        user: UserId,
        package: &PackageName,
        op: OpCode,
        mode: Option<Mode>,
    ) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::SetPackage {
            package: package.clone(),
            op,
            mode,
        });
        let key = (user, package.clone(), op);
        let previous = match mode {
            Some(mode) => inner.package_modes.insert(key, mode),
            None => inner.package_modes.remove(&key),
        };
        previous != mode
    }

    fn uid_modes(&self, uid: Uid) -> Vec<UidModeEntry> {
        self.all_uid_modes()
            .into_iter()
            .filter(|entry| entry.uid == uid)
            .collect()
    }

    fn package_modes(&self, user: UserId, package: &str) -> Vec<PackageModeEntry> {
        self.all_package_modes()
            .into_iter()
            .filter(|entry| entry.user == user && entry.package.as_str() == package)
            .collect()
    }

    fn all_uid_modes(&self) -> Vec<UidModeEntry> {
        self.inner
            .lock()
            .uid_modes
            .iter()
            .map(|((uid, device, op), mode)| UidModeEntry {
                uid: *uid,
                device: device.clone(),
                op: *op,
                mode: *mode,
            })
            .collect()
    }

    fn all_package_modes(&self) -> Vec<PackageModeEntry> {
        self.inner
            .lock()
            .package_modes
            .iter()
            .map(|((user, package, op), mode)| PackageModeEntry {
                user: *user,
                package: package.clone(),
                op: *op,
                mode: *mode,
            })
            .collect()
    }

    fn remove_uid(&mut self, uid: Uid) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::RemoveUid(uid));
        let before = inner.uid_modes.len();
        inner.uid_modes.retain(|(owner, _, _), _| *owner != uid);
        inner.uid_modes.len() != before
    }

    fn remove_package(&mut self, user: UserId, package: &str) -> bool {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(StoreCall::RemovePackage(PackageName::new(package)));
        let before = inner.package_modes.len();
        inner
            .package_modes
            .retain(|(owner, name, _), _| !(*owner == user && name.as_str() == package));
        inner.package_modes.len() != before
    }

    fn remove_user(&mut self, user: UserId) {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::RemoveUser(user));
        inner.uid_modes.retain(|(uid, _, _), _| uid.user_id() != user);
        inner.package_modes.retain(|(owner, _, _), _| *owner != user);
    }

    fn clear(&mut self) {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::Clear);
        inner.uid_modes.clear();
        inner.package_modes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let store = RecordingModeStore::new();
        let mut handle = store.clone();
        let device = DeviceId::default_device();
        assert!(handle.set_uid_mode(Uid(10100), &device, OpCode(26), Some(Mode::Allowed)));
        assert!(!handle.set_uid_mode(Uid(10100), &device, OpCode(26), Some(Mode::Allowed)));
        assert_eq!(
            store.uid_mode(Uid(10100), &device, OpCode(26)),
            Some(Mode::Allowed)
        );
        assert_eq!(store.calls().len(), 2);
    }
}
