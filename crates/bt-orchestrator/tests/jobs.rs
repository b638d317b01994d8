//! End-to-end job tests against the in-memory worker cluster

use std::sync::Arc;
use std::time::Duration;

use bt_core::config::{EngineConfig, SnapshotFile};
use bt_core::{ErrorCategory, Event, EventBus, JobId, SessionFilter, Subscription, WorkerId};
use bt_orchestrator::{JobError, JobSpec, JobStatus, Orchestrator, SegmentState};
use bt_protocol::EventKind;
use bt_test_utils::{document, engine_config, reverse, worker, FakeConnector};

const WAIT: Duration = Duration::from_secs(10);

fn orchestrator(config: EngineConfig) -> (Orchestrator, Arc<FakeConnector>) {
    let connector = FakeConnector::new();
    let orchestrator = Orchestrator::from_config(config, connector.clone(), EventBus::new(4096))
        .expect("valid test configuration");
    (orchestrator, connector)
}

fn spec(document: &str, session: &str) -> JobSpec {
    JobSpec::new(document, "ru", "sr", "test-model").with_session(session)
}

fn subscribe(orchestrator: &Orchestrator, session: &str) -> Subscription {
    orchestrator
        .bus()
        .subscribe(SessionFilter::session(session), 4096)
}

fn id(name: &str) -> WorkerId {
    WorkerId::new(name)
}

/// What the fake translator makes of a document of blank-line separated paragraphs
fn reversed_paragraphs(document: &str) -> String {
    document
        .split("\n\n")
        .map(reverse)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn count(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

#[tokio::test]
async fn test_happy_path_translates_in_order() {
    let (orchestrator, connector) = orchestrator(engine_config(vec![worker("a", 2)]));
    let mut events = subscribe(&orchestrator, "s1");
    let doc = document(4, 86);

    let handle = orchestrator.submit(spec(&doc, "s1")).unwrap();
    let job_id = handle.id();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(output.text(), reversed_paragraphs(&doc));
    assert_eq!(output.segments.len(), 4);
    assert!(output
        .segments
        .iter()
        .all(|s| s.state == SegmentState::Succeeded && s.attempts == 1 && !s.cached));
    assert_eq!(output.per_worker.get(&id("a")), Some(&4));

    let events = events.drain();
    assert_eq!(events.first().map(|e| e.kind), Some(EventKind::JobStarted));
    assert_eq!(events.last().map(|e| e.kind), Some(EventKind::JobCompleted));
    assert_eq!(count(&events, EventKind::StepCompleted), 4);
    assert_eq!(events[0].total_items, Some(4));

    // progress never goes backwards and only reaches 1 on completion
    let progress: Vec<f64> = events.iter().filter_map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(progress.last(), Some(&1.0));
    assert!(progress[..progress.len() - 1].iter().all(|p| *p < 1.0));

    let status = orchestrator.status(&job_id).unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.completed_segments, 4);
    assert_eq!(status.total_segments, 4);
    assert_eq!(status.progress, 1.0);

    // per-segment remote files are cleaned up
    let host = connector.host(&id("a"));
    assert!(host.file_paths().iter().all(|p| !p.contains("/jobs/")));
    assert_eq!(host.translations(), 4);
}

#[tokio::test]
async fn test_capacity_bounds_cluster_concurrency() {
    let (orchestrator, connector) =
        orchestrator(engine_config(vec![worker("a", 1), worker("b", 1)]));
    for name in ["a", "b"] {
        connector
            .host(&id(name))
            .set_translate_delay(Duration::from_millis(100));
    }
    let doc = document(10, 86);

    let handle = orchestrator.submit(spec(&doc, "s2")).unwrap();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(output.text(), reversed_paragraphs(&doc));
    assert!(connector.cluster_in_flight().max() <= 2);
    assert_eq!(connector.host(&id("a")).in_flight().max(), 1);
    assert_eq!(connector.host(&id("b")).in_flight().max(), 1);
    assert_eq!(output.per_worker.values().sum::<usize>(), 10);
}

#[tokio::test]
async fn test_failing_worker_falls_back_to_healthy_one() {
    let (orchestrator, connector) =
        orchestrator(engine_config(vec![worker("a", 2), worker("b", 2)]));
    connector.host(&id("a")).set_translate_exit(1);
    let mut system = subscribe(&orchestrator, "system");
    let doc = document(4, 86);

    let handle = orchestrator.submit(spec(&doc, "s3")).unwrap();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(output.text(), reversed_paragraphs(&doc));
    assert_eq!(output.per_worker.get(&id("b")), Some(&4));
    assert_eq!(output.per_worker.get(&id("a")), None);
    assert!(output.segments.iter().all(|s| s.attempts <= 3));
    assert!(output
        .segments
        .iter()
        .all(|s| s.worker.as_ref() == Some(&id("b"))));

    let degraded: Vec<_> = system
        .drain()
        .into_iter()
        .filter(|e| e.kind == EventKind::WorkerDegraded)
        .collect();
    assert!(!degraded.is_empty());
    assert_eq!(degraded[0].step.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_stale_worker_is_reconciled_before_translating() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("translate.sh"), "#!/bin/sh\nexec translate \"$@\"\n").unwrap();
    let mut config = engine_config(vec![worker("a", 2)]);
    config.snapshot_files = vec![SnapshotFile {
        local_path: dir.path().join("translate.sh"),
        remote_rel_path: "bin/translate".to_string(),
        executable: true,
    }];
    let (orchestrator, connector) = orchestrator(config);
    let host = connector.host(&id("a"));
    host.put_file("/srv/a/.version", "stale");
    let mut events = subscribe(&orchestrator, "s4");

    let handle = orchestrator.submit(spec(&document(3, 86), "s4")).unwrap();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    let log = host.log();
    let version_upload = log
        .iter()
        .position(|entry| entry == "upload /srv/a/.version")
        .expect("version file uploaded");
    let first_translation = log
        .iter()
        .position(|entry| entry.starts_with("cd "))
        .expect("translation ran");
    assert!(version_upload < first_translation, "{:?}", log);
    assert_ne!(host.file("/srv/a/.version").unwrap().as_ref(), b"stale");
    assert!(host.file("/srv/a/bin/translate").is_some());

    let events = events.drain();
    let completed: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::ReconcileCompleted)
        .collect();
    assert!(!completed.is_empty());
    assert!(completed.iter().all(|e| e.error.is_none()));
    // reconciled once per worker per job
    assert_eq!(count(&events, EventKind::ReconcileStarted), 1);
}

fn with_snapshot(mut config: EngineConfig, dir: &tempfile::TempDir) -> EngineConfig {
    std::fs::write(dir.path().join("translate.sh"), "#!/bin/sh\nexec translate \"$@\"\n").unwrap();
    config.snapshot_files = vec![SnapshotFile {
        local_path: dir.path().join("translate.sh"),
        remote_rel_path: "bin/translate".to_string(),
        executable: true,
    }];
    config
}

#[tokio::test]
async fn test_failed_reconcile_moves_job_to_other_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = with_snapshot(engine_config(vec![worker("a", 2), worker("b", 2)]), &dir);
    config.max_attempts = 2;
    let (orchestrator, connector) = orchestrator(config);
    let a = connector.host(&id("a"));
    a.set_upload_fails(true);

    let doc = document(4, 86);
    let handle = orchestrator.submit(spec(&doc, "unsynced")).unwrap();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(output.text(), reversed_paragraphs(&doc));
    assert_eq!(output.per_worker.get(&id("b")), Some(&4));
    assert_eq!(a.translations(), 0);
    // one failed reconcile takes the worker out; nobody tries it again
    let uploads = a
        .log()
        .iter()
        .filter(|entry| *entry == "upload /srv/a/bin/translate")
        .count();
    assert!(uploads <= 1, "{:?}", a.log());
}

#[tokio::test]
async fn test_failed_reconcile_on_only_worker_fails_segment() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = with_snapshot(engine_config(vec![worker("a", 2)]), &dir);
    config.max_attempts = 3;
    let (orchestrator, connector) = orchestrator(config);
    connector.host(&id("a")).set_upload_fails(true);

    let handle = orchestrator.submit(spec(&document(1, 86), "unsynced-only")).unwrap();
    let error = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap_err();

    match &error {
        JobError::SegmentFailed { attempts, reason, .. } => {
            assert_eq!(*attempts, 1);
            assert!(reason.contains("reconciliation"), "{}", reason);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_keeps_completed_segments() {
    let mut config = engine_config(vec![worker("a", 1)]);
    config.max_in_flight_segments = 1;
    let (orchestrator, connector) = orchestrator(config);
    connector
        .host(&id("a"))
        .set_translate_delay(Duration::from_millis(200));
    let mut events = subscribe(&orchestrator, "s5");

    let handle = orchestrator.submit(spec(&document(20, 86), "s5")).unwrap();
    let job_id = handle.id();

    let mut completed = 0;
    while completed < 3 {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if event.kind == EventKind::StepCompleted {
            completed += 1;
        }
    }
    orchestrator.cancel(&job_id).unwrap();

    let result = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
    assert_eq!(result.unwrap_err(), JobError::Cancelled);

    let status = orchestrator.status(&job_id).unwrap();
    assert_eq!(status.status, JobStatus::Cancelled);
    assert_eq!(status.completed_segments, 3);
    assert_eq!(status.in_flight_segments, 0);

    let rest = events.drain();
    assert!(kinds(&rest).contains(&EventKind::JobCancelled));
    assert_eq!(count(&rest, EventKind::StepCompleted), 0);

    // cancelling a finished job is a no-op
    orchestrator.cancel(&job_id).unwrap();
    assert_eq!(orchestrator.status(&job_id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_empty_document_completes_immediately() {
    let (orchestrator, connector) = orchestrator(engine_config(vec![worker("a", 1)]));
    let mut events = subscribe(&orchestrator, "empty");

    let handle = orchestrator.submit(spec("", "empty")).unwrap();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert!(output.document.is_empty());
    assert!(output.segments.is_empty());
    assert_eq!(connector.host(&id("a")).opens(), 0);
    assert_eq!(
        kinds(&events.drain()),
        vec![EventKind::JobStarted, EventKind::JobCompleted]
    );
}

#[tokio::test]
async fn test_whitespace_is_preserved_around_segments() {
    let mut config = engine_config(vec![worker("a", 2)]);
    config.max_segment_chars = 12;
    let (orchestrator, _connector) = orchestrator(config);
    let doc = "\n  first line\n\n\nsecond\n";

    let handle = orchestrator.submit(spec(doc, "ws")).unwrap();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(output.text(), "\n  enil tsrif\n\n\ndnoces\n");
    assert_eq!(output.segments.len(), 2);
}

#[tokio::test]
async fn test_exhausted_segment_fails_strict_job() {
    let mut config = engine_config(vec![worker("a", 1)]);
    config.max_attempts = 1;
    let (orchestrator, connector) = orchestrator(config);
    connector.host(&id("a")).set_translate_exit(1);
    let mut events = subscribe(&orchestrator, "strict");

    let handle = orchestrator.submit(spec(&document(2, 86), "strict")).unwrap();
    let job_id = handle.id();
    let error = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap_err();

    match &error {
        JobError::SegmentFailed {
            attempts, cause, ..
        } => {
            assert_eq!(*attempts, 1);
            assert_eq!(*cause, ErrorCategory::Worker);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(error.category(), ErrorCategory::Worker);

    let status = orchestrator.status(&job_id).unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert!(status.last_error.is_some());

    let events = events.drain();
    let failed: Vec<_> = events.iter().filter(|e| e.kind == EventKind::JobFailed).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.is_some());
}

#[tokio::test]
async fn test_lenient_job_keeps_source_text() {
    let mut config = engine_config(vec![worker("a", 1)]);
    config.max_attempts = 2;
    config.strict_segment_failure = false;
    let (orchestrator, connector) = orchestrator(config);
    connector.host(&id("a")).set_translate_exit(3);
    let mut events = subscribe(&orchestrator, "lenient");
    let doc = document(3, 86);

    let handle = orchestrator.submit(spec(&doc, "lenient")).unwrap();
    let job_id = handle.id();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(output.text(), doc);
    assert_eq!(output.warnings().count(), 3);
    assert!(output.warnings().all(|s| s.attempts == 2 && s.error.is_some()));

    let status = orchestrator.status(&job_id).unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.failed_segments, 3);

    let steps: Vec<_> = events
        .drain()
        .into_iter()
        .filter(|e| e.kind == EventKind::StepCompleted)
        .collect();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|e| e.error.is_some()));
}

#[tokio::test]
async fn test_spec_overrides_strict_default() {
    let mut config = engine_config(vec![worker("a", 1)]);
    config.max_attempts = 1;
    let (orchestrator, connector) = orchestrator(config);
    connector.host(&id("a")).set_translate_exit(1);

    let handle = orchestrator
        .submit(spec("one paragraph", "override").with_strict(false))
        .unwrap();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(output.text(), "one paragraph");
}

#[tokio::test]
async fn test_transient_failure_retries_on_same_worker() {
    let (orchestrator, connector) = orchestrator(engine_config(vec![worker("a", 1)]));
    orchestrator.pool().probe_all().await;
    let host = connector.host(&id("a"));
    host.fail_next_commands(1);

    let handle = orchestrator.submit(spec("short text", "retry")).unwrap();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(output.text(), "txet trohs");
    assert_eq!(output.segments[0].attempts, 2);
    assert_eq!(output.segments[0].worker, Some(id("a")));
    // the reset session was discarded and a fresh one opened
    assert_eq!(host.opens(), 2);
}

#[tokio::test]
async fn test_segment_timeout_is_transient() {
    let mut config = engine_config(vec![worker("a", 1)]);
    config.max_attempts = 1;
    config.command_timeout_ms = 100;
    config.segment_timeout_ms = 100;
    let (orchestrator, connector) = orchestrator(config);
    connector
        .host(&id("a"))
        .set_translate_delay(Duration::from_secs(5));

    let handle = orchestrator.submit(spec("slow", "timeout")).unwrap();
    let error = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap_err();

    assert!(
        matches!(
            error,
            JobError::SegmentFailed {
                cause: ErrorCategory::Transient,
                ..
            }
        ),
        "{:?}",
        error
    );
}

#[tokio::test]
async fn test_job_deadline() {
    let mut config = engine_config(vec![worker("a", 1)]);
    config.job_timeout_ms = Some(150);
    let (orchestrator, connector) = orchestrator(config);
    connector
        .host(&id("a"))
        .set_translate_delay(Duration::from_secs(5));

    let handle = orchestrator.submit(spec(&document(2, 86), "deadline")).unwrap();
    let job_id = handle.id();
    let error = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap_err();

    assert_eq!(error, JobError::Deadline(Duration::from_millis(150)));
    assert_eq!(orchestrator.status(&job_id).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_repeated_segments_are_served_from_cache() {
    let (orchestrator, connector) = orchestrator(engine_config(vec![worker("a", 2)]));
    let doc = document(3, 86);

    let first = orchestrator.submit(spec(&doc, "c1")).unwrap();
    let first = tokio::time::timeout(WAIT, first.wait()).await.unwrap().unwrap();
    let host = connector.host(&id("a"));
    assert_eq!(host.translations(), 3);

    let mut events = subscribe(&orchestrator, "c2");
    let second = orchestrator.submit(spec(&doc, "c2")).unwrap();
    let second = tokio::time::timeout(WAIT, second.wait()).await.unwrap().unwrap();

    assert_eq!(second.text(), first.text());
    assert_eq!(host.translations(), 3);
    assert!(second.segments.iter().all(|s| s.cached));
    assert_eq!(count(&events.drain(), EventKind::StepCompleted), 3);
    assert_eq!(orchestrator.cache_stats().hits, 3);

    // a different target language is a different request
    let other = orchestrator
        .submit(JobSpec::new(doc.as_str(), "ru", "en", "test-model"))
        .unwrap();
    tokio::time::timeout(WAIT, other.wait()).await.unwrap().unwrap();
    assert_eq!(host.translations(), 6);
}

#[tokio::test]
async fn test_required_tags_select_workers() {
    let gpu = worker("b", 2).with_tags(["gpu"]);
    let (orchestrator, _connector) = orchestrator(engine_config(vec![worker("a", 2), gpu]));

    let handle = orchestrator
        .submit(spec(&document(4, 86), "tags").with_tags(["GPU"]))
        .unwrap();
    let output = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(output.per_worker.get(&id("b")), Some(&4));
    assert_eq!(output.per_worker.len(), 1);
}

#[tokio::test]
async fn test_no_healthy_worker_fails_job() {
    let (orchestrator, connector) = orchestrator(engine_config(vec![worker("a", 1)]));
    connector.host(&id("a")).set_probe_fails(true);

    let handle = orchestrator.submit(spec("text", "unhealthy")).unwrap();
    let error = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap_err();
    assert_eq!(error, JobError::NoHealthyWorker);
}

#[tokio::test]
async fn test_context_chars_reach_the_worker() {
    let (orchestrator, connector) = orchestrator(engine_config(vec![worker("a", 1)]));

    let handle = orchestrator
        .submit(spec("text", "context").with_context_chars(512))
        .unwrap();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();

    let log = connector.host(&id("a")).log();
    let command = log.iter().find(|e| e.starts_with("cd ")).unwrap();
    assert!(command.contains("--context 512"), "{}", command);
    assert!(command.contains("--model test-model"), "{}", command);
}

#[tokio::test]
async fn test_unknown_job_and_invalid_spec() {
    let (orchestrator, _connector) = orchestrator(engine_config(vec![worker("a", 1)]));
    let unknown = JobId::new();

    assert_eq!(orchestrator.status(&unknown), Err(JobError::UnknownJob(unknown)));
    assert_eq!(orchestrator.cancel(&unknown), Err(JobError::UnknownJob(unknown)));
    assert!(matches!(
        orchestrator.submit(JobSpec::new("text", "", "sr", "m")),
        Err(JobError::Invalid(_))
    ));
}

#[tokio::test]
async fn test_invalid_port_is_rejected() {
    for port in [0, 65536] {
        let config = engine_config(vec![worker("a", 1).with_port(port)]);
        let result = Orchestrator::from_config(config, FakeConnector::new(), EventBus::default());
        assert!(result.is_err());
    }
}

#[tokio::test]
async fn test_forget_only_finished_jobs() {
    let (orchestrator, connector) = orchestrator(engine_config(vec![worker("a", 1)]));
    connector
        .host(&id("a"))
        .set_translate_delay(Duration::from_millis(200));

    let handle = orchestrator.submit(spec("text", "forget")).unwrap();
    let job_id = handle.id();
    assert!(!orchestrator.forget(&job_id).unwrap());
    assert_eq!(orchestrator.jobs().len(), 1);

    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert!(orchestrator.forget(&job_id).unwrap());
    assert!(orchestrator.jobs().is_empty());
    assert_eq!(orchestrator.status(&job_id), Err(JobError::UnknownJob(job_id)));
}

#[tokio::test]
async fn test_shutdown_stops_running_jobs() {
    let (orchestrator, connector) = orchestrator(engine_config(vec![worker("a", 1)]));
    connector
        .host(&id("a"))
        .set_translate_delay(Duration::from_secs(5));

    let handle = orchestrator.submit(spec(&document(2, 86), "shutdown")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(WAIT, orchestrator.shutdown()).await.unwrap();
    let result = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
    assert_eq!(result.unwrap_err(), JobError::Shutdown);
    assert!(orchestrator.pool().is_shutdown());
    assert!(matches!(
        orchestrator.submit(spec("text", "late")),
        Err(JobError::Shutdown)
    ));
}

#[tokio::test]
async fn test_status_watch_reports_transitions() {
    let (orchestrator, _connector) = orchestrator(engine_config(vec![worker("a", 2)]));

    let handle = orchestrator.submit(spec(&document(2, 86), "watch")).unwrap();
    let mut watch = handle.watch();
    let finished = tokio::time::timeout(WAIT, watch.wait_for(|s| s.status.is_terminal()))
        .await
        .unwrap()
        .unwrap()
        .clone();

    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.progress, 1.0);
    assert!(handle.wait().await.is_ok());
}
