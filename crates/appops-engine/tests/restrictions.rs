//! User and global restrictions, exclusions, bypass and pause/resume

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use appops_core::{
    AppOpsError, ClientToken, ConnectionId, Mode, RestrictionToken, StartType, UserId, WatchFlags,
};
use appops_engine::{OpFilter, OpRequest, PackageTagsList, StartOptions, UserScope};
use appops_testkit::*;
use common::{app, harness, system, Harness};
use std::sync::Arc;

const TOKEN: RestrictionToken = RestrictionToken(7);

fn check(h: &Harness, request: &OpRequest) -> Mode {
    h.engine.check_operation(&system(), request, false).unwrap()
}

fn note(h: &Harness, request: &OpRequest) -> Mode {
    h.engine.note_operation(&system(), request, None).unwrap()
}

#[test]
fn user_restriction_spares_excluded_packages() {
    let h = harness();
    h.engine
        .set_user_restriction(
            &system(),
            TOKEN,
            OP_VIBRATE,
            true,
            Some(PackageTagsList::from_packages([CAM_PACKAGE])),
            UserScope::User(UserId::SYSTEM),
        )
        .unwrap();

    assert_eq!(check(&h, &OpRequest::new(OP_VIBRATE, CAM_UID, CAM_PACKAGE)), Mode::Allowed);
    assert_eq!(check(&h, &OpRequest::new(OP_VIBRATE, MIC_UID, MIC_PACKAGE)), Mode::Ignored);
    assert_eq!(
        check(&h, &OpRequest::new(OP_VIBRATE, PROXY_UID, PROXY_PACKAGE)),
        Mode::Ignored
    );
    assert_eq!(
        check(&h, &OpRequest::new(OP_VIBRATE, WORK_CAM_UID, CAM_PACKAGE)),
        Mode::Allowed,
        "other users are out of scope"
    );
}

#[test]
fn tag_exclusions_apply_to_notes_but_not_checks() {
    let h = harness();
    let mut exclusions = PackageTagsList::new();
    exclusions.add_tag(MIC_PACKAGE, "recorder");
    h.engine
        .set_user_restriction(&system(), TOKEN, OP_VIBRATE, true, Some(exclusions), UserScope::AllUsers)
        .unwrap();

    let recorder = OpRequest::new(OP_VIBRATE, MIC_UID, MIC_PACKAGE).with_tag("recorder");
    let notes = OpRequest::new(OP_VIBRATE, MIC_UID, MIC_PACKAGE).with_tag("notes");
    assert_eq!(note(&h, &recorder), Mode::Allowed);
    assert_eq!(note(&h, &notes), Mode::Ignored);
    assert_eq!(check(&h, &notes), Mode::Allowed, "checks match exclusions by package");
}

#[test]
fn bypass_requires_a_shared_class() {
    let h = harness();
    h.engine
        .set_user_restriction(&system(), TOKEN, OP_RECORD_AUDIO, true, None, UserScope::AllUsers)
        .unwrap();
    h.engine
        .set_user_restriction(&system(), TOKEN, OP_VIBRATE, true, None, UserScope::AllUsers)
        .unwrap();

    let dialer_audio = OpRequest::new(OP_RECORD_AUDIO, DIALER_UID, DIALER_PACKAGE);
    let dialer_vibrate = OpRequest::new(OP_VIBRATE, DIALER_UID, DIALER_PACKAGE);
    assert_eq!(note(&h, &dialer_audio), Mode::Allowed, "microphone is exempt-eligible");
    assert_eq!(note(&h, &dialer_vibrate), Mode::Ignored, "vibrate has no bypass class");
    assert_eq!(
        note(&h, &OpRequest::new(OP_RECORD_AUDIO, MIC_UID, MIC_PACKAGE)),
        Mode::Ignored
    );
}

#[test]
fn global_restrictions_apply_to_bypass_eligible_packages() {
    let h = harness();
    h.engine
        .set_global_restriction(&system(), TOKEN, OP_RECORD_AUDIO, true)
        .unwrap();

    let dialer_audio = OpRequest::new(OP_RECORD_AUDIO, DIALER_UID, DIALER_PACKAGE);
    assert_eq!(note(&h, &dialer_audio), Mode::Ignored);

    h.engine.remove_restriction_token(&system(), TOKEN).unwrap();
    assert_eq!(note(&h, &dialer_audio), Mode::Allowed);
}

#[test]
fn restriction_pauses_and_lifting_resumes_recording() {
    let mut h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_started(&system(), ConnectionId(1), watcher.clone(), OpFilter::Op(OP_RECORD_AUDIO), None)
        .unwrap();
    h.engine
        .watch_active(&system(), ConnectionId(1), watcher.clone(), OpFilter::Op(OP_RECORD_AUDIO), None)
        .unwrap();
    let mic = OpRequest::new(OP_RECORD_AUDIO, MIC_UID, MIC_PACKAGE);

    h.engine
        .start_operation(&app(MIC_UID), ClientToken(1), &mic, &StartOptions::default())
        .unwrap();
    h.clock.advance_ms(200);

    h.engine
        .set_global_restriction(&system(), TOKEN, OP_RECORD_AUDIO, true)
        .unwrap();
    assert_eq!(check(&h, &mic), Mode::Ignored);
    assert!(!h.engine.is_operation_active(&system(), &mic).unwrap());
    h.clock.advance_ms(5_000);

    h.engine
        .set_global_restriction(&system(), TOKEN, OP_RECORD_AUDIO, false)
        .unwrap();
    assert_eq!(check(&h, &mic), Mode::Allowed);
    assert!(h.engine.is_operation_active(&system(), &mic).unwrap());
    h.clock.advance_ms(300);
    h.engine
        .finish_operation(&app(MIC_UID), ClientToken(1), &mic)
        .unwrap();

    h.flush();
    let starts: Vec<StartType> = watcher.started().iter().map(|e| e.start_type).collect();
    assert_eq!(starts, vec![StartType::Started, StartType::Resumed]);
    let active: Vec<bool> = watcher.active_changes().iter().map(|e| e.active).collect();
    assert_eq!(active, vec![true, false, true, false]);

    let ops = h
        .engine
        .package_ops(&system(), MIC_UID, MIC_PACKAGE, None)
        .unwrap()
        .expect("usage recorded");
    assert_eq!(
        ops.ops[0].attributions[0].last_duration_ms,
        Some(500),
        "paused time is not counted"
    );
}

#[test]
fn start_while_restricted_is_parked_until_lifted() {
    let mut h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_started(&system(), ConnectionId(1), watcher.clone(), OpFilter::All, None)
        .unwrap();
    let mic = OpRequest::new(OP_RECORD_AUDIO, MIC_UID, MIC_PACKAGE);
    h.engine
        .set_global_restriction(&system(), TOKEN, OP_RECORD_AUDIO, true)
        .unwrap();

    let mode = h
        .engine
        .start_operation(&system(), ClientToken(4), &mic, &StartOptions::default())
        .unwrap();
    assert_eq!(mode, Mode::Ignored);
    assert!(!h.engine.is_operation_active(&system(), &mic).unwrap());

    h.engine.remove_restriction_token(&system(), TOKEN).unwrap();
    assert!(h.engine.is_operation_active(&system(), &mic).unwrap());

    h.flush();
    let starts: Vec<(StartType, Mode)> = watcher
        .started()
        .iter()
        .map(|e| (e.start_type, e.result))
        .collect();
    assert_eq!(
        starts,
        vec![(StartType::Failed, Mode::Ignored), (StartType::Resumed, Mode::Allowed)]
    );
}

#[test]
fn mode_change_pauses_running_usage() {
    let h = harness();
    let mic = OpRequest::new(OP_RECORD_AUDIO, MIC_UID, MIC_PACKAGE);
    h.engine
        .start_operation(&system(), ClientToken(1), &mic, &StartOptions::default())
        .unwrap();

    h.engine
        .set_uid_mode(&system(), MIC_UID, OP_RECORD_AUDIO, Mode::Ignored)
        .unwrap();
    assert!(!h.engine.is_operation_active(&system(), &mic).unwrap());

    h.engine
        .set_uid_mode(&system(), MIC_UID, OP_RECORD_AUDIO, Mode::Allowed)
        .unwrap();
    assert!(h.engine.is_operation_active(&system(), &mic).unwrap());
}

#[test]
fn restriction_changes_reach_mode_watchers() {
    let mut h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_mode_changes(
            &system(),
            ConnectionId(1),
            watcher.clone(),
            OpFilter::Op(OP_COARSE_LOCATION),
            None,
            WatchFlags::empty(),
        )
        .unwrap();

    h.engine
        .set_global_restriction(&system(), TOKEN, OP_FINE_LOCATION, true)
        .unwrap();
    // Installing the same restriction again changes nothing
    h.engine
        .set_global_restriction(&system(), TOKEN, OP_FINE_LOCATION, true)
        .unwrap();

    h.flush();
    let changes = watcher.mode_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].op, OP_COARSE_LOCATION);
    assert_eq!(changes[0].uid, None);
}

#[test]
fn removing_a_user_drops_its_restrictions() {
    let h = harness();
    h.engine
        .set_user_restriction(&system(), TOKEN, OP_CAMERA, true, None, UserScope::User(WORK_USER))
        .unwrap();
    h.engine
        .set_uid_mode(&system(), WORK_CAM_UID, OP_CAMERA, Mode::Allowed)
        .unwrap();
    let work_camera = OpRequest::new(OP_CAMERA, WORK_CAM_UID, CAM_PACKAGE);
    assert_eq!(check(&h, &work_camera), Mode::Ignored);

    h.engine.user_removed(WORK_USER);
    assert_eq!(check(&h, &work_camera), Mode::Errored, "override and restriction are gone");
}

#[test]
fn restrictions_need_their_own_privilege() {
    let h = harness();
    let err = h
        .engine
        .set_global_restriction(&app(CAM_UID), TOKEN, OP_VIBRATE, true)
        .unwrap_err();
    assert!(matches!(err, AppOpsError::SecurityFault { .. }));
}
