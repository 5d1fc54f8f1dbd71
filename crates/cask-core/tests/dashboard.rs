use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cask_core::scanner::{detail, scan, stats};
use cask_core::{AttemptPhase, MigrateOptions, MigrationPolicy, ResultStatus, ScanFilter, View};

mod common;

use common::{store, Exp};

#[test]
fn views_differ_for_active_alias() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = store(temp.path());
    let old = Exp::new("proj.Old", 1);
    let new = Exp::new("proj.New", 1);
    store.load_or_create(&old, false).expect("compute");
    store
        .migrate(
            &old.identity(),
            new.meta(),
            MigrationPolicy::Alias,
            &MigrateOptions::default(),
        )
        .expect("alias");

    let resolved = scan(temp.path(), &ScanFilter::default(), View::Resolved).expect("scan");
    let pointer = resolved
        .iter()
        .find(|summary| summary.namespace == "proj.New")
        .expect("pointer listed");
    assert_eq!(pointer.result_status, ResultStatus::Success);
    assert_eq!(pointer.link, "active");
    assert_eq!(
        pointer.effective_directory,
        store.object_dir(&old.identity()).expect("object dir")
    );

    let original = scan(temp.path(), &ScanFilter::default(), View::Original).expect("scan");
    let pointer = original
        .iter()
        .find(|summary| summary.namespace == "proj.New")
        .expect("pointer listed");
    assert_eq!(pointer.result_status, ResultStatus::Migrated);

    let shown = detail(temp.path(), &new.identity(), View::Resolved)
        .expect("detail")
        .expect("present");
    assert_eq!(shown.anchor_status, Some(ResultStatus::Success));
    assert_eq!(shown.state.status(), ResultStatus::Success);
    assert_eq!(
        shown.metadata.map(|meta| meta.namespace).as_deref(),
        Some("proj.Old")
    );

    let raw = detail(temp.path(), &new.identity(), View::Original)
        .expect("detail")
        .expect("present");
    assert_eq!(raw.state.status(), ResultStatus::Migrated);
    assert_eq!(
        raw.metadata.map(|meta| meta.namespace).as_deref(),
        Some("proj.New")
    );
    assert_eq!(raw.anchor_status, Some(ResultStatus::Success));
    assert!(raw.migration.is_some());
    assert!(!raw.events.is_empty());

    let totals = stats(temp.path()).expect("stats");
    assert_eq!(totals.total, 2);
    assert_eq!(totals.success, 1);
    assert_eq!(totals.active_aliases, 1);
    assert_eq!(totals.by_result_status.get(&ResultStatus::Migrated), Some(&1));
}

#[test]
fn queued_attempts_are_filterable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(store(temp.path()));
    let done = Exp::new("proj.Done", 2);
    store.load_or_create(&done, false).expect("compute");
    let queued = Exp::new("proj.Waiting", 3)
        .queued()
        .with_delay(Duration::from_millis(400));

    let running = {
        let store = Arc::clone(&store);
        let queued = queued.clone();
        thread::spawn(move || store.load_or_create(&queued, false))
    };
    while store.attempt(&queued.identity()).expect("attempt").is_none() {
        thread::sleep(Duration::from_millis(10));
    }

    let filter = ScanFilter {
        attempt_phase: Some(AttemptPhase::Queued),
        ..ScanFilter::default()
    };
    let hits = scan(temp.path(), &filter, View::Resolved).expect("scan");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].namespace, "proj.Waiting");
    assert_eq!(hits[0].result_status, ResultStatus::Pending);
    assert_eq!(stats(temp.path()).expect("stats").queued, 1);

    running.join().expect("thread").expect("finishes");
    assert!(scan(temp.path(), &filter, View::Resolved)
        .expect("scan")
        .is_empty());
}
