//! Codebase reconciliation against fake workers

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use bt_core::config::SnapshotFile;
use bt_core::{EventBus, EventSessionId, SessionFilter, WorkerId};
use bt_protocol::EventKind;
use bt_test_utils::{worker, FakeConnector};
use bt_worker::reconcile::{EXECUTABLE_MODE, REGULAR_MODE};
use bt_worker::{
    LeaseOutcome, PoolSettings, ReconcileError, ReconcileOutcome, Reconciler, WorkerPool,
};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    _dir: tempfile::TempDir,
    pool: WorkerPool,
    connector: Arc<FakeConnector>,
    reconciler: Reconciler,
    bus: EventBus,
}

fn snapshot_files(dir: &Path) -> Vec<SnapshotFile> {
    std::fs::write(dir.join("translate.sh"), "#!/bin/sh\nexec python3 translate.py \"$@\"\n").unwrap();
    std::fs::write(dir.join("prompt.txt"), "Translate faithfully.\n").unwrap();
    vec![
        SnapshotFile {
            local_path: dir.join("translate.sh"),
            remote_rel_path: "bin/translate".to_string(),
            executable: true,
        },
        SnapshotFile {
            local_path: dir.join("prompt.txt"),
            remote_rel_path: "share/prompt.txt".to_string(),
            executable: false,
        },
    ]
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new();
    let bus = EventBus::default();
    let pool = WorkerPool::new(
        &[worker("a", 2), worker("b", 1)],
        PoolSettings {
            connection_timeout: TIMEOUT,
            probe_timeout: TIMEOUT,
            idle_timeout: Duration::from_secs(60),
            health_window: Duration::from_secs(30),
        },
        connector.clone(),
        bus.clone(),
    )
    .unwrap();
    let reconciler = Reconciler::new(snapshot_files(dir.path()), TIMEOUT, bus.clone());
    Fixture {
        _dir: dir,
        pool,
        connector,
        reconciler,
        bus,
    }
}

async fn reconcile(f: &Fixture, name: &str) -> Result<ReconcileOutcome, ReconcileError> {
    let cancel = CancellationToken::new();
    let mut lease = f
        .pool
        .acquire(&WorkerId::new(name), "reconcile", TIMEOUT, &cancel)
        .await
        .unwrap();
    let result = f
        .reconciler
        .reconcile(&mut lease, &EventSessionId::new("job-1"), &cancel)
        .await;
    lease.release(LeaseOutcome::Ok).await;
    result
}

#[tokio::test]
async fn test_stale_version_triggers_upload() {
    let f = fixture();
    let host = f.connector.host(&WorkerId::new("a"));
    host.put_file("/srv/a/.version", "stale");
    let mut events = f.bus.subscribe_default(SessionFilter::session("job-1"));

    let outcome = reconcile(&f, "a").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Synced { files: 2 });

    let snapshot = f.reconciler.snapshot().await.unwrap();
    assert_eq!(
        host.file("/srv/a/.version").unwrap(),
        snapshot.aggregate().as_bytes()
    );
    assert_eq!(host.file_mode("/srv/a/bin/translate"), Some(EXECUTABLE_MODE));
    assert_eq!(host.file_mode("/srv/a/share/prompt.txt"), Some(REGULAR_MODE));
    assert_eq!(host.file_mode("/srv/a/.version"), Some(REGULAR_MODE));

    // the version file is written after every other file
    let uploads: Vec<_> = host
        .log()
        .into_iter()
        .filter(|entry| entry.starts_with("upload "))
        .collect();
    assert_eq!(uploads.last().map(String::as_str), Some("upload /srv/a/.version"));

    let kinds: Vec<_> = events.drain().into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::ReconcileStarted, EventKind::ReconcileCompleted]
    );
}

#[tokio::test]
async fn test_missing_version_triggers_upload() {
    let f = fixture();
    let outcome = reconcile(&f, "b").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Synced { files: 2 });
    assert!(f
        .connector
        .host(&WorkerId::new("b"))
        .file("/srv/b/bin/translate")
        .is_some());
}

#[tokio::test]
async fn test_matching_version_uploads_nothing() {
    let f = fixture();
    reconcile(&f, "a").await.unwrap();
    let host = f.connector.host(&WorkerId::new("a"));
    let uploads_before = host.log().iter().filter(|e| e.starts_with("upload ")).count();

    let outcome = reconcile(&f, "a").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::UpToDate);
    let uploads_after = host.log().iter().filter(|e| e.starts_with("upload ")).count();
    assert_eq!(uploads_before, uploads_after);
}

#[tokio::test]
async fn test_upload_failure_is_reported() {
    let f = fixture();
    f.connector.host(&WorkerId::new("a")).set_upload_fails(true);
    let mut events = f.bus.subscribe_default(SessionFilter::session("job-1"));

    let error = reconcile(&f, "a").await.unwrap_err();
    assert!(matches!(error, ReconcileError::Session(_)));

    let completed = events
        .drain()
        .into_iter()
        .find(|e| e.kind == EventKind::ReconcileCompleted)
        .unwrap();
    assert!(completed.error.is_some());
    assert!(f
        .connector
        .host(&WorkerId::new("a"))
        .file("/srv/a/.version")
        .is_none());
}

#[tokio::test]
async fn test_concurrent_reconciles_on_one_worker_upload_once() {
    let f = Arc::new(fixture());
    let first = {
        let f = Arc::clone(&f);
        tokio::spawn(async move { reconcile(&f, "a").await })
    };
    let second = {
        let f = Arc::clone(&f);
        tokio::spawn(async move { reconcile(&f, "a").await })
    };

    let mut outcomes = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
    outcomes.sort_by_key(|o| matches!(o, ReconcileOutcome::Synced { .. }));
    assert_eq!(
        outcomes,
        vec![ReconcileOutcome::UpToDate, ReconcileOutcome::Synced { files: 2 }]
    );
}

#[tokio::test]
async fn test_workers_reconcile_independently() {
    let f = fixture();
    reconcile(&f, "a").await.unwrap();
    assert_eq!(
        reconcile(&f, "b").await.unwrap(),
        ReconcileOutcome::Synced { files: 2 }
    );
}
