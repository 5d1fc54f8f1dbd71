use std::fs;
use std::panic::{self, AssertUnwindSafe};

use cask_core::{layout, EventKind, ObjectStore, ResultStatus, SchemaVersion, StoreError};
use serde_json::{json, Value};

mod common;

use common::{store, Exp};

#[test]
fn repeated_load_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let task = Exp::new("exp.Train", 1);

    let first = store.load_or_create(&task, false).expect("first load");
    let second = store.load_or_create(&task, false).expect("second load");

    assert_eq!(first, second);
    assert_eq!(first["run"], json!(1));
    assert_eq!(task.calls(), 1);
    let creates = store
        .events(&task.identity())
        .expect("events")
        .iter()
        .filter(|event| event.is(EventKind::Create))
        .count();
    assert_eq!(creates, 1);
}

#[test]
fn force_recompute_runs_again() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let task = Exp::new("exp.Train", 2);

    store.load_or_create(&task, false).expect("first load");
    let forced = store.load_or_create(&task, true).expect("forced load");

    assert_eq!(forced["run"], json!(2));
    assert_eq!(task.calls(), 2);
    let state = store.state(&task.identity()).expect("state");
    assert_eq!(state.status(), ResultStatus::Success);
    assert_eq!(state.attempt.map(|attempt| attempt.number), Some(2));
}

#[test]
fn object_layout_follows_namespace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let task = Exp::new("proj.pipelines.Train", 3);
    store.load_or_create(&task, false).expect("load");

    let dir = temp
        .path()
        .join("proj")
        .join("pipelines")
        .join("Train")
        .join(&task.identity().hash);
    assert_eq!(store.object_dir(&task.identity()).expect("object dir"), dir);
    assert!(layout::state_path(&dir).is_file());
    assert!(layout::metadata_path(&dir).is_file());
    assert!(layout::success_marker_path(&dir).is_file());
    assert!(dir.join(common::PAYLOAD_FILE).is_file());
    assert_eq!(store.effective_directory(&task.identity()).expect("resolve"), dir);
}

#[test]
fn default_version_is_omitted_on_disk() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let plain = Exp::new("exp.Model", 4);
    let bumped = Exp::versioned("exp.Model", 4, SchemaVersion::new(2.0));
    store.load_or_create(&plain, false).expect("load plain");
    store.load_or_create(&bumped, false).expect("load bumped");

    let plain_dir = store.object_dir(&plain.identity()).expect("object dir");
    let raw: Value = serde_json::from_str(
        &fs::read_to_string(layout::metadata_path(&plain_dir)).expect("read metadata"),
    )
    .expect("metadata json");
    assert!(raw.get("version").is_none());
    let read = store
        .metadata(&plain.identity())
        .expect("metadata")
        .expect("present");
    assert_eq!(read.version, SchemaVersion::DEFAULT);

    let read = store
        .metadata(&bumped.identity())
        .expect("metadata")
        .expect("present");
    assert_eq!(read.version, SchemaVersion::new(2.0));
    assert_ne!(plain.identity().hash, bumped.identity().hash);
}

#[test]
fn failure_is_surfaced_then_retried() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let task = Exp::new("exp.Flaky", 5).failing();

    let err = store.load_or_create(&task, false).unwrap_err();
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::ComputeFailed { message, .. }) => {
            assert!(message.contains("refused to converge"));
        }
        other => panic!("expected compute failure, got {other:?}"),
    }
    assert!(!store.exists(&task.identity()).expect("exists"));
    let state = store.state(&task.identity()).expect("state");
    assert_eq!(state.status(), ResultStatus::Failed);

    task.set_failing(false);
    let value = store.load_or_create(&task, false).expect("retry");
    assert_eq!(value["run"], json!(2));
    assert!(store.exists(&task.identity()).expect("exists"));
}

#[test]
fn panicking_compute_leaves_failed_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let task = Exp::new("exp.Crash", 6).panicking();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| store.load_or_create(&task, false)));
    assert!(outcome.is_err());

    let state = store.state(&task.identity()).expect("state");
    assert_eq!(state.status(), ResultStatus::Failed);
    assert_eq!(
        state.result.error.map(|error| error.kind).as_deref(),
        Some("cancelled")
    );
    assert!(store.attempt(&task.identity()).expect("attempt").is_none());
}

#[test]
fn explicit_create_recomputes_plain_objects() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let task = Exp::new("exp.Train", 7);
    store.load_or_create(&task, false).expect("load");
    let created = store.create(&task).expect("create");
    assert_eq!(created["run"], json!(2));
}

#[test]
fn env_forced_namespace_always_recomputes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = common::quick_config(temp.path());
    config.force_recompute.insert("exp.Always".into());
    let store = ObjectStore::new(config);
    let task = Exp::new("exp.Always", 8);

    store.load_or_create(&task, false).expect("first");
    store.load_or_create(&task, false).expect("second");
    assert_eq!(task.calls(), 2);
}

#[test]
fn corrupt_state_fails_closed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let task = Exp::new("exp.Broken", 9);
    store.load_or_create(&task, false).expect("load");
    let dir = store.object_dir(&task.identity()).expect("object dir");
    fs::write(layout::state_path(&dir), "{\"result\": ").expect("corrupt state");

    let err = store.load_or_create(&task, false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::CorruptRecord { .. })
    ));
    assert_eq!(task.calls(), 1);
}

#[test]
fn legacy_status_is_never_treated_as_success() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let task = Exp::new("exp.Legacy", 10);
    store.load_or_create(&task, false).expect("load");
    let dir = store.object_dir(&task.identity()).expect("object dir");
    fs::write(
        layout::state_path(&dir),
        r#"{"schema_version": 1, "result": {"status": "complete"}, "attempt": null}"#,
    )
    .expect("legacy state");

    let state = store.state(&task.identity()).expect("state");
    assert_eq!(state.status(), ResultStatus::Failed);
    assert!(!store.exists(&task.identity()).expect("exists"));
    let value = store.load_or_create(&task, false).expect("recompute");
    assert_eq!(value["run"], json!(2));
}
