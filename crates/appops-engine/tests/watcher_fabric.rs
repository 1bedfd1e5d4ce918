//! Listener registration, filtering, echo suppression and delivery

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use appops_core::{
    ConnectionId, Mode, ModeWatcher, ProcessCapabilities, UidState, WatchFlags,
};
use appops_engine::{ModeChangeOptions, OpFilter, OpRequest};
use appops_testkit::*;
use common::{app, harness, system};
use std::sync::Arc;

#[test]
fn the_same_listener_keeps_one_id_across_ops() {
    let h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    let conn = ConnectionId(1);
    let first = h
        .engine
        .watch_mode_changes(&system(), conn, watcher.clone(), OpFilter::Op(OP_CAMERA), None, WatchFlags::empty())
        .unwrap();
    let second = h
        .engine
        .watch_mode_changes(&system(), conn, watcher.clone(), OpFilter::Op(OP_VIBRATE), None, WatchFlags::empty())
        .unwrap();
    assert_eq!(first, second);

    assert!(h.engine.stop_watching_mode(first));
    assert!(!h.engine.stop_watching_mode(first), "already removed from every op");
}

#[test]
fn echo_suppression_skips_the_changing_listener() {
    let mut h = harness();
    let settings = Arc::new(RecordingWatcher::new());
    let other = Arc::new(RecordingWatcher::new());
    let settings_id = h
        .engine
        .watch_mode_changes(&system(), ConnectionId(1), settings.clone(), OpFilter::All, None, WatchFlags::empty())
        .unwrap();
    h.engine
        .watch_mode_changes(&system(), ConnectionId(2), other.clone(), OpFilter::All, None, WatchFlags::empty())
        .unwrap();

    let options = ModeChangeOptions {
        exclude: Some(settings_id),
        ..ModeChangeOptions::default()
    };
    h.engine
        .set_uid_mode_with(&system(), CAM_UID, OP_VIBRATE, Mode::Ignored, &options)
        .unwrap();

    h.flush();
    assert!(settings.is_empty());
    assert_eq!(other.mode_changes().len(), 1);
}

#[test]
fn shared_uid_change_notifies_each_package() {
    let mut h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_mode_changes(&system(), ConnectionId(1), watcher.clone(), OpFilter::Op(OP_VIBRATE), None, WatchFlags::empty())
        .unwrap();

    h.engine
        .set_uid_mode(&system(), SHARED_UID, OP_VIBRATE, Mode::Ignored)
        .unwrap();
    h.flush();

    let mut packages: Vec<String> = watcher
        .mode_changes()
        .iter()
        .filter_map(|e| e.package.as_ref().map(|p| p.as_str().to_owned()))
        .collect();
    packages.sort();
    assert_eq!(packages, vec![SHARED_PACKAGE_B.to_owned(), SHARED_PACKAGE_A.to_owned()]);
}

#[test]
fn mode_watchers_register_on_the_switch_op() {
    let mut h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_mode_changes(&system(), ConnectionId(1), watcher.clone(), OpFilter::Op(OP_FINE_LOCATION), None, WatchFlags::empty())
        .unwrap();

    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_COARSE_LOCATION, Mode::Ignored)
        .unwrap();
    h.flush();
    assert_eq!(watcher.mode_changes().len(), 1);
    assert_eq!(watcher.mode_changes()[0].op, OP_COARSE_LOCATION);
}

#[test]
fn unprivileged_watchers_only_hear_their_own_uid() {
    let mut h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_noted(&app(CAM_UID), ConnectionId(1), watcher.clone(), OpFilter::All, None)
        .unwrap();

    h.engine
        .note_operation(&system(), &OpRequest::new(OP_VIBRATE, MIC_UID, MIC_PACKAGE), None)
        .unwrap();
    h.engine
        .note_operation(&system(), &OpRequest::new(OP_VIBRATE, CAM_UID, CAM_PACKAGE), None)
        .unwrap();
    h.flush();

    let noted = watcher.noted();
    assert_eq!(noted.len(), 1);
    assert_eq!(noted[0].uid, CAM_UID);
}

#[test]
fn panicking_listener_does_not_block_others() {
    let mut h = harness();
    let healthy = Arc::new(RecordingWatcher::new());
    let broken: Arc<dyn ModeWatcher> = Arc::new(PanickingWatcher);
    h.engine
        .watch_mode_changes(&system(), ConnectionId(1), broken, OpFilter::All, None, WatchFlags::empty())
        .unwrap();
    h.engine
        .watch_mode_changes(&system(), ConnectionId(2), healthy.clone(), OpFilter::All, None, WatchFlags::empty())
        .unwrap();

    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_VIBRATE, Mode::Ignored)
        .unwrap();
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_VIBRATE, Mode::Errored)
        .unwrap();
    assert_eq!(h.flush(), 4);
    assert_eq!(healthy.mode_changes().len(), 2, "the broken listener stays registered but isolated");
}

#[test]
fn closing_a_connection_drops_all_its_listeners() {
    let mut h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    let conn = ConnectionId(5);
    h.engine
        .watch_mode_changes(&system(), conn, watcher.clone(), OpFilter::All, None, WatchFlags::empty())
        .unwrap();
    h.engine
        .watch_noted(&system(), conn, watcher.clone(), OpFilter::All, None)
        .unwrap();
    h.engine
        .watch_started(&system(), conn, watcher.clone(), OpFilter::All, None)
        .unwrap();

    assert_eq!(h.engine.connection_closed(conn), 3);
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_VIBRATE, Mode::Ignored)
        .unwrap();
    h.engine
        .note_operation(&system(), &OpRequest::new(OP_VIBRATE, CAM_UID, CAM_PACKAGE), None)
        .unwrap();
    assert_eq!(h.flush(), 0);
    assert!(watcher.is_empty());
}

#[test]
fn foreground_watchers_hear_uid_state_changes() {
    let mut h = harness();
    let foreground = Arc::new(RecordingWatcher::new());
    let plain = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_mode_changes(
            &system(),
            ConnectionId(1),
            foreground.clone(),
            OpFilter::Op(OP_CAMERA),
            None,
            WatchFlags::FOREGROUND_CHANGES,
        )
        .unwrap();
    h.engine
        .watch_mode_changes(&system(), ConnectionId(2), plain.clone(), OpFilter::Op(OP_CAMERA), None, WatchFlags::empty())
        .unwrap();
    h.engine
        .set_uid_mode(&system(), CAM_UID, OP_CAMERA, Mode::Foreground)
        .unwrap();
    h.flush();
    foreground.clear();
    plain.clear();

    h.engine
        .update_uid_state(CAM_UID, UidState::Top, ProcessCapabilities::all());
    h.flush();
    assert_eq!(foreground.mode_changes().len(), 1);
    assert!(plain.is_empty());

    // Leaving the top state settles later
    h.engine
        .update_uid_state(CAM_UID, UidState::Cached, ProcessCapabilities::empty());
    h.flush();
    assert_eq!(foreground.mode_changes().len(), 1);
    assert_eq!(h.engine.process_pending_uid_states(), 0);

    let due = h.engine.next_uid_state_commit().expect("pending change");
    h.clock.set_elapsed_ms(due);
    assert_eq!(h.engine.process_pending_uid_states(), 1);
    h.flush();
    assert_eq!(foreground.mode_changes().len(), 2);
}

#[tokio::test]
async fn dispatcher_task_delivers_in_order() {
    let h = harness();
    let watcher = Arc::new(RecordingWatcher::new());
    h.engine
        .watch_mode_changes(&system(), ConnectionId(1), watcher.clone(), OpFilter::Op(OP_VIBRATE), None, WatchFlags::empty())
        .unwrap();
    let common::Harness { engine, dispatcher, .. } = h;
    let task = tokio::spawn(dispatcher.run());

    for mode in [Mode::Ignored, Mode::Errored, Mode::Default] {
        engine.set_uid_mode(&system(), CAM_UID, OP_VIBRATE, mode).unwrap();
    }
    drop(engine);
    task.await.expect("dispatcher exits once the engine is gone");

    assert_eq!(watcher.mode_changes().len(), 3);
}
