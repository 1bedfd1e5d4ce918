//! Hierarchical record store
//!
//! uid → package → op → device → attribution tag, held in arenas and
//! linked by keys. Every op record keeps an entry for the default device.
//! Empty records are pruned upwards: attribution, device, op, package, uid.

pub mod arena;

pub use arena::{Arena, Key};

use appops_core::{
    AttributionTag, BypassFlags, DeviceId, OpCode, PackageName, Uid, UserId,
};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::usage::{AttributedRecord, AttributionId};

/// Key of an attributed record
pub type AttributionKey = Key<AttributedRecord>;

/// All packages of one uid
#[derive(Debug, Default)]
pub struct UidRecord {
    /// Package name → record
    pub packages: BTreeMap<PackageName, Key<PackageRecord>>,
}

/// One package under a uid
#[derive(Debug)]
pub struct PackageRecord {
    /// Owning uid
    pub uid: Uid,
    /// Package name
    pub name: PackageName,
    /// Op → record
    pub ops: BTreeMap<OpCode, Key<OpRecord>>,
    /// Cached bypass descriptor, filled on first resolution
    pub bypass: Option<BypassFlags>,
    /// Every tag seen on a request, declared or not
    pub known_tags: HashSet<AttributionTag>,
    /// Tags declared by the package; `None` when not validated
    pub validated_tags: Option<HashSet<AttributionTag>>,
}

impl PackageRecord {
    /// Bypass descriptor, empty until resolved
    pub fn bypass(&self) -> BypassFlags {
        self.bypass.unwrap_or_default()
    }

    /// Whether `tag` passes validation
    pub fn is_tag_valid(&self, tag: &AttributionTag) -> bool {
        self.validated_tags
            .as_ref()
            .map_or(true, |tags| tags.contains(tag))
    }
}

/// Tag → attributed record, for one device
pub type TagMap = HashMap<Option<AttributionTag>, AttributionKey>;

/// One op under a package
#[derive(Debug)]
pub struct OpRecord {
    /// Op code
    pub op: OpCode,
    /// Device → attribution records; the default device is always present
    pub devices: HashMap<DeviceId, TagMap>,
}

impl OpRecord {
    fn new(op: OpCode) -> Self {
        let mut devices = HashMap::new();
        devices.insert(DeviceId::default_device(), TagMap::new());
        Self { op, devices }
    }

    fn is_empty(&self) -> bool {
        self.devices.values().all(HashMap::is_empty)
    }
}

/// Facts about a package supplied when its record is created or refreshed
#[derive(Debug, Clone, Default)]
pub struct PackageFacts {
    /// Bypass descriptor
    pub bypass: BypassFlags,
    /// Declared tags; `None` disables validation
    pub declared_tags: Option<Vec<AttributionTag>>,
}

/// The record hierarchy
#[derive(Debug, Default)]
pub struct Registry {
    uids: BTreeMap<Uid, UidRecord>,
    packages: Arena<PackageRecord>,
    ops: Arena<OpRecord>,
    attributions: Arena<AttributedRecord>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record of `package` under `uid`
    pub fn package(&self, uid: Uid, package: &str) -> Option<&PackageRecord> {
        let key = *self.uids.get(&uid)?.packages.get(package)?;
        self.packages.get(key)
    }

    /// Package names recorded under `uid`
    pub fn package_names(&self, uid: Uid) -> Vec<PackageName> {
        self.uids
            .get(&uid)
            .map(|record| record.packages.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Uids with at least one package record
    pub fn uids(&self) -> Vec<Uid> {
        self.uids.keys().copied().collect()
    }

    /// Find or create the record of `package` under `uid`
    ///
    /// Facts only fill caches that are still empty; use
    /// [`refresh_package`](Self::refresh_package) after an update.
    pub fn ensure_package(
        &mut self,
        uid: Uid,
        package: &PackageName,
        facts: &PackageFacts,
    ) -> Key<PackageRecord> {
        let uid_record = self.uids.entry(uid).or_default();
        if let Some(key) = uid_record.packages.get(package.as_str()).copied() {
            if let Some(record) = self.packages.get_mut(key) {
                if record.bypass.is_none() {
                    record.bypass = Some(facts.bypass);
                }
                if record.validated_tags.is_none() {
                    record.validated_tags = declared_set(facts);
                }
                return key;
            }
        }

        let key = self.packages.insert(PackageRecord {
            uid,
            name: package.clone(),
            ops: BTreeMap::new(),
            bypass: Some(facts.bypass),
            known_tags: HashSet::new(),
            validated_tags: declared_set(facts),
        });
        uid_record.packages.insert(package.clone(), key);
        tracing::trace!(uid = %uid, package = %package, "package record created");
        key
    }

    /// Find or create a package record whose caches stay unresolved
    ///
    /// Used when restoring history; the first live request fills the caches.
    pub fn restore_package(&mut self, uid: Uid, package: &PackageName) -> Key<PackageRecord> {
        let uid_record = self.uids.entry(uid).or_default();
        if let Some(key) = uid_record.packages.get(package.as_str()).copied() {
            if self.packages.contains(key) {
                return key;
            }
        }
        let key = self.packages.insert(PackageRecord {
            uid,
            name: package.clone(),
            ops: BTreeMap::new(),
            bypass: None,
            known_tags: HashSet::new(),
            validated_tags: None,
        });
        uid_record.packages.insert(package.clone(), key);
        key
    }

    /// Replace cached facts of an existing package
    pub fn refresh_package(&mut self, uid: Uid, package: &str, facts: &PackageFacts) -> bool {
        let Some(key) = self.package_key(uid, package) else {
            return false;
        };
        if let Some(record) = self.packages.get_mut(key) {
            record.bypass = Some(facts.bypass);
            record.validated_tags = declared_set(facts);
        }
        true
    }

    /// Remember a tag seen on a request
    pub fn note_tag(&mut self, package: Key<PackageRecord>, tag: &AttributionTag) {
        if let Some(record) = self.packages.get_mut(package) {
            if !record.known_tags.contains(tag) {
                record.known_tags.insert(tag.clone());
            }
        }
    }

    /// Find or create the attributed record for (op, device, tag) of a package
    pub fn ensure_attribution(
        &mut self,
        package: Key<PackageRecord>,
        op: OpCode,
        device: &DeviceId,
        tag: Option<&AttributionTag>,
    ) -> Option<AttributionKey> {
        let package_record = self.packages.get_mut(package)?;
        let uid = package_record.uid;
        let package_name = package_record.name.clone();
        let op_key = match package_record.ops.get(&op) {
            Some(key) => *key,
            None => {
                let key = self.ops.insert(OpRecord::new(op));
                package_record.ops.insert(op, key);
                key
            }
        };

        let op_record = self.ops.get_mut(op_key)?;
        let tags = op_record.devices.entry(device.clone()).or_default();
        if let Some(key) = tags.get(&tag.cloned()) {
            return Some(*key);
        }
        let key = self.attributions.insert(AttributedRecord::new(AttributionId {
            uid,
            package: package_name,
            op,
            device: device.clone(),
            tag: tag.cloned(),
        }));
        tags.insert(tag.cloned(), key);
        Some(key)
    }

    /// Look up an attributed record without creating anything
    pub fn find_attribution(
        &self,
        uid: Uid,
        package: &str,
        op: OpCode,
        device: &DeviceId,
        tag: Option<&AttributionTag>,
    ) -> Option<AttributionKey> {
        let package_record = self.package(uid, package)?;
        let op_record = self.ops.get(*package_record.ops.get(&op)?)?;
        op_record.devices.get(device)?.get(&tag.cloned()).copied()
    }

    /// Borrow an attributed record
    pub fn attribution(&self, key: AttributionKey) -> Option<&AttributedRecord> {
        self.attributions.get(key)
    }

    /// Mutably borrow an attributed record
    pub fn attribution_mut(&mut self, key: AttributionKey) -> Option<&mut AttributedRecord> {
        self.attributions.get_mut(key)
    }

    /// Keys of attributed records matching `predicate`
    pub fn attributions_where(
        &self,
        predicate: impl FnMut(&AttributedRecord) -> bool,
    ) -> Vec<AttributionKey> {
        self.attributions.keys_where(predicate)
    }

    /// Every attributed record
    pub fn attributions(&self) -> impl Iterator<Item = (AttributionKey, &AttributedRecord)> {
        self.attributions.iter()
    }

    /// Attributed records of one package, grouped by op in code order
    pub fn package_attributions(
        &self,
        uid: Uid,
        package: &str,
    ) -> Vec<(OpCode, Vec<&AttributedRecord>)> {
        let Some(package_record) = self.package(uid, package) else {
            return Vec::new();
        };
        package_record
            .ops
            .iter()
            .filter_map(|(op, key)| {
                let op_record = self.ops.get(*key)?;
                let mut records: Vec<&AttributedRecord> = op_record
                    .devices
                    .values()
                    .flat_map(HashMap::values)
                    .filter_map(|key| self.attributions.get(*key))
                    .collect();
                records.sort_by(|a, b| {
                    (a.id.device.as_str(), a.id.tag.as_ref().map(AttributionTag::as_str))
                        .cmp(&(b.id.device.as_str(), b.id.tag.as_ref().map(AttributionTag::as_str)))
                });
                Some((*op, records))
            })
            .collect()
    }

    /// Drop an attributed record if it holds nothing, then prune empty owners
    ///
    /// Returns whether the record was removed.
    pub fn prune(&mut self, key: AttributionKey) -> bool {
        let Some(record) = self.attributions.get(key) else {
            tracing::debug!(?key, "prune of missing attribution record");
            return false;
        };
        if !record.is_prunable() {
            return false;
        }
        let id = record.id.clone();
        self.attributions.remove(key);

        let Some(package_key) = self.package_key(id.uid, id.package.as_str()) else {
            return true;
        };
        let Some(op_key) = self
            .packages
            .get(package_key)
            .and_then(|record| record.ops.get(&id.op).copied())
        else {
            return true;
        };

        let mut op_empty = false;
        if let Some(op_record) = self.ops.get_mut(op_key) {
            if let Some(tags) = op_record.devices.get_mut(&id.device) {
                tags.remove(&id.tag);
                if tags.is_empty() && !id.device.is_default() {
                    op_record.devices.remove(&id.device);
                }
            }
            op_empty = op_record.is_empty();
        }
        if op_empty {
            self.ops.remove(op_key);
            let package_empty = match self.packages.get_mut(package_key) {
                Some(package_record) => {
                    package_record.ops.remove(&id.op);
                    package_record.ops.is_empty()
                }
                None => false,
            };
            if package_empty {
                self.remove_package_record(id.uid, id.package.as_str());
            }
        }
        true
    }

    /// Move records of undeclared tags into the untagged record of the same op and device
    ///
    /// Returns the number of records folded.
    pub fn fold_invalid_tags(&mut self, uid: Uid, package: &str) -> usize {
        let Some(package_key) = self.package_key(uid, package) else {
            return 0;
        };
        let Some(package_record) = self.packages.get(package_key) else {
            return 0;
        };
        let Some(valid) = package_record.validated_tags.clone() else {
            return 0;
        };
        let op_keys: Vec<Key<OpRecord>> = package_record.ops.values().copied().collect();

        let mut folded = 0;
        for op_key in op_keys {
            let Some(op_record) = self.ops.get_mut(op_key) else {
                continue;
            };
            for tags in op_record.devices.values_mut() {
                let invalid: Vec<Option<AttributionTag>> = tags
                    .keys()
                    .filter(|tag| matches!(tag, Some(tag) if !valid.contains(tag)))
                    .cloned()
                    .collect();
                for tag in invalid {
                    let Some(source_key) = tags.remove(&tag) else {
                        continue;
                    };
                    let Some(mut source) = self.attributions.remove(source_key) else {
                        continue;
                    };
                    match tags.get(&None).copied() {
                        Some(target_key) => {
                            if let Some(target) = self.attributions.get_mut(target_key) {
                                target.absorb(source);
                            }
                        }
                        None => {
                            source.id.tag = None;
                            let key = self.attributions.insert(source);
                            tags.insert(None, key);
                        }
                    }
                    folded += 1;
                }
            }
        }
        folded
    }

    /// Remove a package and all of its records; returns the removed attributed records
    pub fn remove_package(&mut self, uid: Uid, package: &str) -> Vec<AttributedRecord> {
        let Some(package_key) = self.package_key(uid, package) else {
            return Vec::new();
        };
        let removed = self.drain_package(package_key);
        self.remove_package_record(uid, package);
        removed
    }

    /// Remove a uid and everything under it
    pub fn remove_uid(&mut self, uid: Uid) -> Vec<AttributedRecord> {
        let Some(uid_record) = self.uids.remove(&uid) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for package_key in uid_record.packages.into_values() {
            removed.extend(self.drain_package(package_key));
            self.packages.remove(package_key);
        }
        removed
    }

    /// Remove every uid of `user`
    pub fn remove_user(&mut self, user: UserId) -> Vec<AttributedRecord> {
        let uids: Vec<Uid> = self
            .uids
            .keys()
            .copied()
            .filter(|uid| uid.user_id() == user)
            .collect();
        uids.into_iter().flat_map(|uid| self.remove_uid(uid)).collect()
    }

    /// Number of attributed records
    pub fn attribution_count(&self) -> usize {
        self.attributions.len()
    }

    /// Number of package records
    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    fn package_key(&self, uid: Uid, package: &str) -> Option<Key<PackageRecord>> {
        self.uids.get(&uid)?.packages.get(package).copied()
    }

    fn drain_package(&mut self, package_key: Key<PackageRecord>) -> Vec<AttributedRecord> {
        let Some(package_record) = self.packages.get_mut(package_key) else {
            return Vec::new();
        };
        let op_keys: Vec<Key<OpRecord>> =
            std::mem::take(&mut package_record.ops).into_values().collect();
        let mut removed = Vec::new();
        for op_key in op_keys {
            let Some(op_record) = self.ops.remove(op_key) else {
                continue;
            };
            for key in op_record.devices.into_values().flat_map(HashMap::into_values) {
                removed.extend(self.attributions.remove(key));
            }
        }
        removed
    }

    fn remove_package_record(&mut self, uid: Uid, package: &str) {
        let Some(uid_record) = self.uids.get_mut(&uid) else {
            return;
        };
        if let Some(key) = uid_record.packages.remove(package) {
            self.packages.remove(key);
        }
        if uid_record.packages.is_empty() {
            self.uids.remove(&uid);
        }
    }
}

fn declared_set(facts: &PackageFacts) -> Option<HashSet<AttributionTag>> {
    facts
        .declared_tags
        .as_ref()
        .map(|tags| tags.iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{AccessKey, EventPool, StartParams};
    use appops_core::{AttributionFlags, ClientToken, OpFlags, Timestamp, UidState};

    const KEY: AccessKey = AccessKey {
        uid_state: UidState::Top,
        flags: OpFlags::SELF,
    };

    fn facts(tags: &[&str]) -> PackageFacts {
        PackageFacts {
            bypass: BypassFlags::empty(),
            declared_tags: Some(tags.iter().map(|t| AttributionTag::new(t)).collect()),
        }
    }

    #[test]
    fn test_default_device_always_present() {
        let mut registry = Registry::new();
        let package = registry.ensure_package(Uid(10100), &"cam.app".into(), &facts(&[]));
        let virtual_device = DeviceId::new("virtual:1");
        let key = registry
            .ensure_attribution(package, OpCode(26), &virtual_device, None)
            .unwrap();
        assert!(registry
            .find_attribution(Uid(10100), "cam.app", OpCode(26), &virtual_device, None)
            .is_some());

        assert!(registry.prune(key));
        assert_eq!(registry.package_count(), 0);
        assert!(registry.uids().is_empty());
    }

    #[test]
    fn test_prune_keeps_records_with_history() {
        let mut registry = Registry::new();
        let package = registry.ensure_package(Uid(10100), &"cam.app".into(), &facts(&[]));
        let device = DeviceId::default_device();
        let key = registry
            .ensure_attribution(package, OpCode(26), &device, None)
            .unwrap();
        registry
            .attribution_mut(key)
            .unwrap()
            .accessed(None, KEY, Timestamp::default());
        assert!(!registry.prune(key));
        assert_eq!(registry.attribution_count(), 1);
    }

    #[test]
    fn test_fold_invalid_tags_into_untagged() {
        let mut registry = Registry::new();
        let name: PackageName = "mic.app".into();
        let package = registry.ensure_package(Uid(10101), &name, &facts(&["recorder", "legacy"]));
        let device = DeviceId::default_device();
        let legacy = AttributionTag::new("legacy");
        let mut pool = EventPool::new(3);

        let key = registry
            .ensure_attribution(package, OpCode(27), &device, Some(&legacy))
            .unwrap();
        registry.attribution_mut(key).unwrap().started(
            &mut pool,
            StartParams {
                token: ClientToken(1),
                proxy: None,
                uid_state: UidState::Top,
                flags: OpFlags::SELF,
                attribution_flags: AttributionFlags::empty(),
                chain_id: None,
            },
            Timestamp::default(),
        );

        registry.refresh_package(Uid(10101), "mic.app", &facts(&["recorder"]));
        assert_eq!(registry.fold_invalid_tags(Uid(10101), "mic.app"), 1);

        let untagged = registry
            .find_attribution(Uid(10101), "mic.app", OpCode(27), &device, None)
            .unwrap();
        let record = registry.attribution(untagged).unwrap();
        assert!(record.is_running());
        assert_eq!(record.id.tag, None);
        assert!(registry
            .find_attribution(Uid(10101), "mic.app", OpCode(27), &device, Some(&legacy))
            .is_none());
    }

    #[test]
    fn test_remove_user_drops_only_that_user() {
        let mut registry = Registry::new();
        let device = DeviceId::default_device();
        for uid in [Uid(10100), Uid(1_010_100)] {
            let package = registry.ensure_package(uid, &"cam.app".into(), &facts(&[]));
            registry.ensure_attribution(package, OpCode(26), &device, None);
        }
        let removed = registry.remove_user(UserId(10));
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.uids(), vec![Uid(10100)]);
    }
}
