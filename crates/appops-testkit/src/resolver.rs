//! Package resolver backed by an in-memory table

use appops_core::{
    AttributionTag, BypassFlags, DeviceId, PackageInfo, PackageName, PackageResolver, Uid, UserId,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// Resolver over a mutable table of installed packages
///
/// Tests install and uninstall packages on it to drive lifecycle
/// scenarios; the engine only ever reads it.
#[derive(Debug, Default)]
pub struct StaticPackageResolver {
    packages: RwLock<BTreeMap<Uid, Vec<PackageInfo>>>,
    devices: RwLock<HashSet<DeviceId>>,
}

impl StaticPackageResolver {
    /// Empty resolver knowing only the default device
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a package, replacing an existing one of the same name
    pub fn install(&self, info: PackageInfo) {
        let mut packages = self.packages.write();
        let list = packages.entry(info.uid).or_default();
        list.retain(|existing| existing.name != info.name);
        list.push(info);
    }

    /// Install a plain package with no bypass classes and no tags
    pub fn install_simple(&self, uid: Uid, name: &str) {
        self.install(PackageInfo::new(uid, name));
    }

    /// Builder-style [`install`](Self::install)
    pub fn with_package(self, info: PackageInfo) -> Self {
        self.install(info);
        self
    }

    /// Remove a package; returns whether it was installed
    pub fn uninstall(&self, uid: Uid, name: &str) -> bool {
        let mut packages = self.packages.write();
        let Some(list) = packages.get_mut(&uid) else {
            return false;
        };
        let before = list.len();
        list.retain(|existing| existing.name.as_str() != name);
        let removed = list.len() != before;
        if list.is_empty() {
            packages.remove(&uid);
        }
        removed
    }

    /// Replace the declared tags of an installed package
    pub fn set_tags(&self, uid: Uid, name: &str, tags: &[&str]) {
        let mut packages = self.packages.write();
        if let Some(info) = packages
            .get_mut(&uid)
            .and_then(|list| list.iter_mut().find(|info| info.name.as_str() == name))
        {
            info.attribution_tags = tags.iter().map(|tag| AttributionTag::new(tag)).collect();
        }
    }

    /// Replace the bypass descriptor of an installed package
    pub fn set_bypass(&self, uid: Uid, name: &str, bypass: BypassFlags) {
        let mut packages = self.packages.write();
        if let Some(info) = packages
            .get_mut(&uid)
            .and_then(|list| list.iter_mut().find(|info| info.name.as_str() == name))
        {
            info.bypass = bypass;
        }
    }

    /// Make a non-default device known
    pub fn add_device(&self, device: DeviceId) {
        self.devices.write().insert(device);
    }
}

impl PackageResolver for StaticPackageResolver {
    fn resolve(&self, uid: Uid, package: &str) -> Option<PackageInfo> {
        self.packages
            .read()
            .get(&uid)?
            .iter()
            .find(|info| info.name.as_str() == package)
            .cloned()
    }

    fn packages_for_uid(&self, uid: Uid) -> Vec<PackageName> {
        self.packages
            .read()
            .get(&uid)
            .map(|list| list.iter().map(|info| info.name.clone()).collect())
            .unwrap_or_default()
    }

    fn uid_for_package(&self, user: UserId, package: &str) -> Option<Uid> {
        self.packages
            .read()
            .iter()
            .filter(|(uid, _)| uid.user_id() == user)
            .find(|(_, list)| list.iter().any(|info| info.name.as_str() == package))
            .map(|(uid, _)| *uid)
    }

    fn is_device_known(&self, device: &DeviceId) -> bool {
        device.is_default() || self.devices.read().contains(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_checks_owning_uid() {
        let resolver = StaticPackageResolver::new();
        resolver.install_simple(Uid(10100), "cam.app");
        assert!(resolver.resolve(Uid(10100), "cam.app").is_some());
        assert!(resolver.resolve(Uid(10101), "cam.app").is_none());
        assert_eq!(
            resolver.uid_for_package(UserId::SYSTEM, "cam.app"),
            Some(Uid(10100))
        );
        assert!(resolver.uninstall(Uid(10100), "cam.app"));
        assert!(resolver.packages_for_uid(Uid(10100)).is_empty());
    }

    #[test]
    fn test_devices() {
        let resolver = StaticPackageResolver::new();
        let virtual_device = DeviceId::new("virtual:3");
        assert!(!resolver.is_device_known(&virtual_device));
        resolver.add_device(virtual_device.clone());
        assert!(resolver.is_device_known(&virtual_device));
    }
}
