//! Read-only queries over modes and usage records

use appops_core::{
    special_package, AttributionTag, CallerContext, DeviceId, Identity, Mode, OpCode, PackageName,
    Privileges, Result, Uid,
};

use super::{AppOpsEngine, EngineState, OpRequest};
use crate::usage::AttributedRecord;

/// Usage summary of one (device, tag)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionEntry {
    /// Attribution tag
    pub tag: Option<AttributionTag>,
    /// Device
    pub device: DeviceId,
    /// Wall-clock time of the latest access
    pub last_access_ms: Option<u64>,
    /// Duration of the latest access, when it was a started usage
    pub last_duration_ms: Option<u64>,
    /// Wall-clock time of the latest rejection
    pub last_reject_ms: Option<u64>,
    /// Proxy of the latest access
    pub proxy: Option<Identity>,
    /// Whether a usage is running now
    pub running: bool,
}

impl AttributionEntry {
    fn from_record(record: &AttributedRecord) -> Self {
        let access = record.last_access();
        Self {
            tag: record.id.tag.clone(),
            device: record.id.device.clone(),
            last_access_ms: access.map(|entry| entry.time_ms),
            last_duration_ms: access.and_then(|entry| entry.duration_ms),
            last_reject_ms: record.last_reject().map(|entry| entry.time_ms),
            proxy: access.and_then(|entry| entry.proxy.clone()),
            running: record.is_running(),
        }
    }
}

/// Stored mode and usage of one op of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpEntry {
    /// Op
    pub op: OpCode,
    /// Package-level mode of the op's switch, or its default
    pub mode: Mode,
    /// Usage per device and tag
    pub attributions: Vec<AttributionEntry>,
}

/// Ops recorded for one package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOps {
    /// Owning uid
    pub uid: Uid,
    /// Package
    pub package: PackageName,
    /// Ops in code order
    pub ops: Vec<OpEntry>,
}

impl AppOpsEngine {
    /// Recorded ops of one package, optionally narrowed to `ops`
    pub fn package_ops(
        &self,
        caller: &CallerContext,
        uid: Uid,
        package: &str,
        ops: Option<&[OpCode]>,
    ) -> Result<Option<PackageOps>> {
        self.require_stats_for(caller, uid)?;
        let show_restricted = caller.has(Privileges::MANAGE_MODES);
        let state = self.state.lock();
        Ok(self.collect_package_ops(&state, uid, package, ops, show_restricted))
    }

    /// Recorded ops of every package, optionally narrowed to `ops`
    pub fn packages_for_ops(&self, caller: &CallerContext, ops: Option<&[OpCode]>) -> Result<Vec<PackageOps>> {
        self.require(caller, Privileges::GET_STATS, "read usage of all packages")?;
        let show_restricted = caller.has(Privileges::MANAGE_MODES);
        let state = self.state.lock();
        let mut result = Vec::new();
        for uid in state.registry.uids() {
            for package in state.registry.package_names(uid) {
                result.extend(self.collect_package_ops(&state, uid, package.as_str(), ops, show_restricted));
            }
        }
        Ok(result)
    }

    /// Stored uid-level mode of `op`'s switch on the default device, or its default
    pub fn uid_mode(&self, caller: &CallerContext, uid: Uid, op: OpCode) -> Result<Mode> {
        self.require_stats_for(caller, uid)?;
        let info = self.op_info(op)?;
        if info.restrict_read {
            self.require(caller, Privileges::MANAGE_MODES, "read a restricted op")?;
        }
        let state = self.state.lock();
        Ok(state
            .modes
            .uid_mode(uid, &DeviceId::default_device(), info.switch)
            .unwrap_or_else(|| self.switch_default(info)))
    }

    /// Stored package-level mode of `op`'s switch, or its default
    pub fn package_mode(&self, caller: &CallerContext, uid: Uid, package: &str, op: OpCode) -> Result<Mode> {
        self.require_stats_for(caller, uid)?;
        let info = self.op_info(op)?;
        if info.restrict_read {
            self.require(caller, Privileges::MANAGE_MODES, "read a restricted op")?;
        }
        let state = self.state.lock();
        Ok(state
            .modes
            .package_mode(uid.user_id(), package, info.switch)
            .unwrap_or_else(|| self.switch_default(info)))
    }

    /// Whether `request`'s op has a running usage
    ///
    /// Without a tag any tag of the package counts.
    pub fn is_operation_active(&self, caller: &CallerContext, request: &OpRequest) -> Result<bool> {
        self.require_stats_for(caller, request.uid)?;
        if !self.catalog.contains(request.op) {
            return Ok(false);
        }
        let claimed = request.package.as_ref().map(PackageName::as_str);
        let Some(package) = special_package(request.uid, claimed).or(claimed) else {
            return Ok(false);
        };
        let state = self.state.lock();
        let active = state.registry.attributions().any(|(_, record)| {
            record.id.uid == request.uid
                && record.id.op == request.op
                && record.id.package.as_str() == package
                && record.id.device == request.device
                && request
                    .attribution_tag
                    .as_ref()
                    .map_or(true, |tag| record.id.tag.as_ref() == Some(tag))
                && record.is_running()
        });
        Ok(active)
    }

    fn collect_package_ops(
        &self,
        state: &EngineState,
        uid: Uid,
        package: &str,
        filter: Option<&[OpCode]>,
        show_restricted: bool,
    ) -> Option<PackageOps> {
        let name = state.registry.package(uid, package)?.name.clone();
        let ops: Vec<OpEntry> = state
            .registry
            .package_attributions(uid, package)
            .into_iter()
            .filter(|(op, _)| filter.map_or(true, |filter| filter.contains(op)))
            .filter_map(|(op, records)| {
                let info = self.catalog.get(op)?;
                if info.restrict_read && !show_restricted {
                    return None;
                }
                let mode = state
                    .modes
                    .package_mode(uid.user_id(), package, info.switch)
                    .unwrap_or_else(|| self.switch_default(info));
                Some(OpEntry {
                    op,
                    mode,
                    attributions: records.into_iter().map(AttributionEntry::from_record).collect(),
                })
            })
            .collect();
        if ops.is_empty() {
            return None;
        }
        Some(PackageOps {
            uid,
            package: name,
            ops,
        })
    }
}
