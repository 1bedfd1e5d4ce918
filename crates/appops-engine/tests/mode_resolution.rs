//! Decisions of check/note against overrides, foreground state and callers

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use appops_core::{
    AppOpsError, CallerContext, ConnectionId, EngineConfig, Mode, Privileges,
    ProcessCapabilities, Uid, UidState, WatchFlags,
};
use appops_engine::{OpFilter, OpRequest};
use appops_testkit::*;
use common::{app, harness, harness_with, system};
use std::sync::Arc;

#[test]
fn unset_ops_resolve_to_their_static_default() {
    let h = harness();
    let camera = OpRequest::new(OP_CAMERA, CAM_UID, CAM_PACKAGE);
    let vibrate = OpRequest::new(OP_VIBRATE, CAM_UID, CAM_PACKAGE);

    assert_eq!(h.engine.check_operation(&system(), &camera, false).unwrap(), Mode::Errored);
    assert_eq!(h.engine.check_operation(&system(), &vibrate, false).unwrap(), Mode::Allowed);
}

#[test]
fn camera_override_is_visible_and_notifies_one_watcher() {
    let mut h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_mode_changes(
            &system(),
            ConnectionId(1),
            watcher.clone(),
            OpFilter::Op(OP_CAMERA),
            None,
            WatchFlags::empty(),
        )
        .unwrap();

    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_CAMERA, Mode::Allowed)
        .unwrap();
    let request = OpRequest::new(OP_CAMERA, CAM_UID, CAM_PACKAGE);
    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Allowed);

    assert_eq!(h.flush(), 1);
    let changes = watcher.mode_changes();
    assert_eq!(changes.len(), 1, "exactly one notification for one package");
    assert_eq!(changes[0].op, OP_CAMERA);
    assert_eq!(changes[0].uid, Some(CAM_UID));
    assert_eq!(changes[0].package.as_ref().map(|p| p.as_str()), Some(CAM_PACKAGE));
}

#[test]
fn clearing_uid_override_reverts_to_package_mode() {
    let h = harness();
    let request = OpRequest::new(OP_VIBRATE, CAM_UID, CAM_PACKAGE);
    h.engine
        .set_package_mode(&system(), CAM_UID, CAM_PACKAGE, OP_VIBRATE, Mode::Errored)
        .unwrap();
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_VIBRATE, Mode::Ignored)
        .unwrap();
    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Ignored);

    // Setting the default clears the override
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_VIBRATE, Mode::Allowed)
        .unwrap();
    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Errored);
}

#[test]
fn overrides_are_stored_on_the_switch_op() {
    let h = harness();
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_FINE_LOCATION, Mode::Ignored)
        .unwrap();

    let coarse = OpRequest::new(OP_COARSE_LOCATION, CAM_UID, CAM_PACKAGE);
    assert_eq!(h.engine.check_operation(&system(), &coarse, false).unwrap(), Mode::Ignored);
    assert_eq!(
        h.engine.uid_mode(&system(), CAM_UID, OP_COARSE_LOCATION).unwrap(),
        Mode::Ignored
    );
}

#[test]
fn foreground_mode_follows_uid_state() {
    let h = harness();
    let request = OpRequest::new(OP_CAMERA, CAM_UID, CAM_PACKAGE);
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_CAMERA, Mode::Foreground)
        .unwrap();

    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Ignored);
    assert_eq!(h.engine.check_operation(&system(), &request, true).unwrap(), Mode::Foreground);

    h.engine
        .update_uid_state(CAM_UID, UidState::Top, ProcessCapabilities::empty());
    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Allowed);

    // A foreground service needs the camera capability
    h.engine
        .update_uid_state(CAM_UID, UidState::ForegroundService, ProcessCapabilities::empty());
    h.clock.advance_ms(h.engine.config().top_state_settle_ms);
    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Ignored);
}

#[test]
fn demotion_waits_for_the_settle_time() {
    let h = harness();
    let request = OpRequest::new(OP_CAMERA, CAM_UID, CAM_PACKAGE);
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_CAMERA, Mode::Foreground)
        .unwrap();
    h.engine
        .update_uid_state(CAM_UID, UidState::Top, ProcessCapabilities::empty());
    h.engine
        .update_uid_state(CAM_UID, UidState::Background, ProcessCapabilities::empty());

    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Allowed);
    h.clock.advance_ms(h.engine.config().top_state_settle_ms);
    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Ignored);
}

#[test]
fn always_allowed_uids_skip_every_lookup() {
    let h = harness();
    let request = OpRequest::for_uid(OP_CAMERA, Uid::SYSTEM);
    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Allowed);
    assert_eq!(h.engine.note_operation(&system(), &request, None).unwrap(), Mode::Allowed);
}

#[test]
fn unknown_op_is_errored_not_an_error() {
    let h = harness();
    let request = OpRequest::new(OP_UNKNOWN, CAM_UID, CAM_PACKAGE);
    assert_eq!(h.engine.check_operation(&system(), &request, false).unwrap(), Mode::Errored);
    assert_eq!(h.engine.note_operation(&system(), &request, None).unwrap(), Mode::Errored);

    let err = h
        .engine
        .set_uid_mode(&system(), CAM_UID, OP_UNKNOWN, Mode::Allowed)
        .unwrap_err();
    assert!(matches!(err, AppOpsError::InvalidArgument { .. }));
}

#[test]
fn invalid_package_differs_by_verb() {
    let h = harness();
    let stranger = OpRequest::new(OP_VIBRATE, CAM_UID, "not.installed");
    assert_eq!(h.engine.check_operation(&system(), &stranger, false).unwrap(), Mode::Allowed);
    assert_eq!(h.engine.note_operation(&system(), &stranger, None).unwrap(), Mode::Ignored);

    // A package owned by another uid is not resolvable for this one
    let borrowed = OpRequest::new(OP_VIBRATE, CAM_UID, MIC_PACKAGE);
    assert_eq!(h.engine.note_operation(&system(), &borrowed, None).unwrap(), Mode::Ignored);
}

#[test]
fn configured_invalid_package_mode_applies_to_checks() {
    let config = EngineConfig {
        check_invalid_package_mode: Some(Mode::Errored),
        ..EngineConfig::default()
    };
    let h = harness_with(config, None);
    let stranger = OpRequest::new(OP_VIBRATE, CAM_UID, "not.installed");
    assert_eq!(h.engine.check_operation(&system(), &stranger, false).unwrap(), Mode::Errored);
}

#[test]
fn callers_need_privileges_for_other_uids() {
    let h = harness();
    let request = OpRequest::new(OP_VIBRATE, CAM_UID, CAM_PACKAGE);

    assert!(h.engine.check_operation(&app(CAM_UID), &request, false).is_ok());
    let err = h
        .engine
        .check_operation(&app(MIC_UID), &request, false)
        .unwrap_err();
    assert!(matches!(err, AppOpsError::SecurityFault { .. }));

    let stats = CallerContext::with_privileges(MIC_UID, Privileges::UPDATE_STATS);
    assert!(h.engine.check_operation(&stats, &request, false).is_ok());

    let err = h
        .engine
        .set_uid_mode(&app(CAM_UID), CAM_UID, OP_VIBRATE, Mode::Ignored)
        .unwrap_err();
    assert!(matches!(err, AppOpsError::SecurityFault { .. }));
}

#[test]
fn restricted_read_ops_need_manage_modes() {
    let h = harness();
    let request = OpRequest::new(OP_READ_CLIPBOARD, CAM_UID, CAM_PACKAGE);
    assert!(h.engine.check_operation(&app(CAM_UID), &request, false).is_err());

    let manager = CallerContext::with_privileges(CAM_UID, Privileges::MANAGE_MODES);
    assert_eq!(h.engine.check_operation(&manager, &request, false).unwrap(), Mode::Allowed);
}

#[test]
fn unknown_device_is_treated_like_an_invalid_package() {
    let h = harness();
    let request = OpRequest::new(OP_VIBRATE, CAM_UID, CAM_PACKAGE).on_device("virtual:7");
    assert_eq!(h.engine.note_operation(&system(), &request, None).unwrap(), Mode::Ignored);

    h.resolver.add_device("virtual:7".into());
    assert_eq!(h.engine.note_operation(&system(), &request, None).unwrap(), Mode::Allowed);
}

#[test]
fn reset_keeps_non_resettable_ops() {
    let h = harness();
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_VIBRATE, Mode::Ignored)
        .unwrap();
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_RUN_IN_BACKGROUND, Mode::Ignored)
        .unwrap();
    h.engine
        .set_package_mode(&system(), MIC_UID, MIC_PACKAGE, OP_VIBRATE, Mode::Ignored)
        .unwrap();

    h.engine
        .reset_all_modes(&system(), None, Some(CAM_PACKAGE))
        .unwrap();
    assert_eq!(h.engine.uid_mode(&system(), CAM_UID, OP_VIBRATE).unwrap(), Mode::Allowed);
    assert_eq!(
        h.engine.uid_mode(&system(), CAM_UID, OP_RUN_IN_BACKGROUND).unwrap(),
        Mode::Ignored
    );
    assert_eq!(
        h.engine
            .package_mode(&system(), MIC_UID, MIC_PACKAGE, OP_VIBRATE)
            .unwrap(),
        Mode::Ignored,
        "other packages keep their overrides"
    );

    h.engine.reset_all_modes(&system(), None, None).unwrap();
    assert_eq!(
        h.engine
            .package_mode(&system(), MIC_UID, MIC_PACKAGE, OP_VIBRATE)
            .unwrap(),
        Mode::Allowed
    );
}
