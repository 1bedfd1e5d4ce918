//! Shared fixtures: a small op catalog and an installed-package table

use appops_core::{
    BypassFlags, Mode, OpCatalog, OpCode, OpInfo, PackageInfo, ProcessCapabilities, Uid, UserId,
};
use std::sync::Arc;

use crate::resolver::StaticPackageResolver;

/// Coarse location; switch of [`OP_FINE_LOCATION`]
pub const OP_COARSE_LOCATION: OpCode = OpCode(0);
/// Fine location, governed by [`OP_COARSE_LOCATION`]
pub const OP_FINE_LOCATION: OpCode = OpCode(1);
/// Vibration
pub const OP_VIBRATE: OpCode = OpCode(3);
/// Camera, denied loudly by default
pub const OP_CAMERA: OpCode = OpCode(26);
/// Microphone
pub const OP_RECORD_AUDIO: OpCode = OpCode(27);
/// Clipboard reads; state is restricted-read
pub const OP_READ_CLIPBOARD: OpCode = OpCode(29);
/// Background execution; excluded from bulk resets
pub const OP_RUN_IN_BACKGROUND: OpCode = OpCode(63);
/// Code absent from the catalog
pub const OP_UNKNOWN: OpCode = OpCode(500);

/// Camera app
pub const CAM_UID: Uid = Uid(10100);
/// Package of [`CAM_UID`]
pub const CAM_PACKAGE: &str = "cam.app";
/// Recorder app declaring the `recorder` and `notes` tags
pub const MIC_UID: Uid = Uid(10101);
/// Package of [`MIC_UID`]
pub const MIC_PACKAGE: &str = "mic.app";
/// Assistant app acting as a proxy for others
pub const PROXY_UID: Uid = Uid(10102);
/// Package of [`PROXY_UID`]
pub const PROXY_PACKAGE: &str = "assistant.app";
/// Uid shared by two packages
pub const SHARED_UID: Uid = Uid(10103);
/// First package of [`SHARED_UID`]
pub const SHARED_PACKAGE_A: &str = "suite.mail";
/// Second package of [`SHARED_UID`]
pub const SHARED_PACKAGE_B: &str = "suite.calendar";
/// Privileged dialer exempt from audio restrictions
pub const DIALER_UID: Uid = Uid(10104);
/// Package of [`DIALER_UID`]
pub const DIALER_PACKAGE: &str = "dialer.app";
/// Camera app installed for a secondary user
pub const WORK_CAM_UID: Uid = Uid(1_010_100);
/// Secondary user owning [`WORK_CAM_UID`]
pub const WORK_USER: UserId = UserId(10);

/// Catalog used across the engine test suites
pub fn test_catalog() -> Arc<OpCatalog> {
    let catalog = OpCatalog::builder()
        .op(OpInfo::new(OP_COARSE_LOCATION, "COARSE_LOCATION", Mode::Allowed)
            .with_foreground_capability(ProcessCapabilities::LOCATION))
        .op(OpInfo::new(OP_FINE_LOCATION, "FINE_LOCATION", Mode::Allowed)
            .with_switch(OP_COARSE_LOCATION)
            .with_foreground_capability(ProcessCapabilities::LOCATION))
        .op(OpInfo::new(OP_VIBRATE, "VIBRATE", Mode::Allowed))
        .op(OpInfo::new(OP_CAMERA, "CAMERA", Mode::Errored)
            .with_bypass(BypassFlags::SYSTEM_UID)
            .with_foreground_capability(ProcessCapabilities::CAMERA))
        .op(OpInfo::new(OP_RECORD_AUDIO, "RECORD_AUDIO", Mode::Allowed)
            .with_bypass(BypassFlags::EXEMPT)
            .with_foreground_capability(ProcessCapabilities::MICROPHONE))
        .op(OpInfo::new(OP_READ_CLIPBOARD, "READ_CLIPBOARD", Mode::Allowed).with_restricted_read())
        .op(OpInfo::new(OP_RUN_IN_BACKGROUND, "RUN_IN_BACKGROUND", Mode::Allowed).without_reset())
        .build()
        .expect("fixture catalog is valid");
    Arc::new(catalog)
}

/// Resolver with every fixture package installed
pub fn standard_resolver() -> StaticPackageResolver {
    StaticPackageResolver::new()
        .with_package(PackageInfo::new(CAM_UID, CAM_PACKAGE))
        .with_package(
            PackageInfo::new(MIC_UID, MIC_PACKAGE)
                .with_tag("recorder")
                .with_tag("notes"),
        )
        .with_package(PackageInfo::new(PROXY_UID, PROXY_PACKAGE))
        .with_package(PackageInfo::new(SHARED_UID, SHARED_PACKAGE_A))
        .with_package(PackageInfo::new(SHARED_UID, SHARED_PACKAGE_B))
        .with_package(
            PackageInfo::new(DIALER_UID, DIALER_PACKAGE)
                .with_bypass(BypassFlags::PRIVILEGED | BypassFlags::EXEMPT),
        )
        .with_package(PackageInfo::new(WORK_CAM_UID, CAM_PACKAGE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use appops_core::PackageResolver;

    #[test]
    fn test_fixtures_are_consistent() {
        let catalog = test_catalog();
        assert_eq!(catalog.default_mode(OP_CAMERA), Some(Mode::Errored));
        assert!(!catalog.contains(OP_UNKNOWN));
        assert_eq!(WORK_CAM_UID.user_id(), WORK_USER);

        let resolver = standard_resolver();
        assert_eq!(resolver.packages_for_uid(SHARED_UID).len(), 2);
        assert_eq!(
            resolver.uid_for_package(WORK_USER, CAM_PACKAGE),
            Some(WORK_CAM_UID)
        );
    }
}
