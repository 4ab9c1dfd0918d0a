//! Dispatcher behaviour against a scripted in-process engine

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ocr_dispatch::config::SourceDisposition;
use ocr_dispatch::models::result::{FailureKind, Outcome};
use ocr_dispatch::services::dispatcher::{Dispatcher, DispatcherConfig};
use ocr_dispatch::services::routing::FailureDescriptor;

fn start(engine: &Arc<FakeEngine>, dirs: &TestDirs, config: DispatcherConfig) -> Dispatcher {
    Dispatcher::start(engine.clone(), dirs.router(SourceDisposition::Archive), config)
}

#[tokio::test]
async fn test_concurrency_never_exceeds_capacity() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::succeeding().with_delay(Duration::from_millis(80)));
    let dispatcher = start(&engine, &dirs, dispatcher_config(2));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            dispatcher
                .submit(dirs.watched_job(&format!("doc{i}.pdf"), MINIMAL_PDF))
                .unwrap()
        })
        .collect();
    let results = futures::future::join_all(handles).await;

    assert!(results.iter().all(|r| r.outcome.is_success()));
    assert_eq!(engine.calls(), 8);
    assert_eq!(engine.peak(), 2);

    let stats = dispatcher.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn test_jobs_start_in_submission_order() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::succeeding().with_delay(Duration::from_millis(10)));
    let dispatcher = start(&engine, &dirs, dispatcher_config(1));

    let jobs: Vec<_> = (0..5)
        .map(|i| dirs.watched_job(&format!("page{i}.pdf"), MINIMAL_PDF))
        .collect();
    let sources: Vec<_> = jobs.iter().map(|j| j.source_path.clone()).collect();
    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job| dispatcher.submit(job).unwrap())
        .collect();
    futures::future::join_all(handles).await;

    assert_eq!(engine.started(), sources);
}

#[tokio::test]
async fn test_success_places_output_and_archives_source() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::succeeding());
    let dispatcher = start(&engine, &dirs, dispatcher_config(1));

    let job = dirs.watched_job("invoice.pdf", MINIMAL_PDF);
    let job_id = job.id;
    let result = dispatcher.submit(job).unwrap().await;

    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.output_path, Some(dirs.output.join("invoice.pdf")));

    let output = std::fs::read(dirs.output.join("invoice.pdf")).unwrap();
    assert!(output.starts_with(OCR_MARKER));
    assert!(output.ends_with(MINIMAL_PDF));

    // Only the final output, no staging leftovers
    assert_eq!(list_dir(&dirs.output), vec!["invoice.pdf"]);
    assert_eq!(list_dir(&dirs.archive), vec![format!("{job_id}-invoice.pdf")]);
    assert!(list_dir(&dirs.input).is_empty());
    assert!(list_dir(&dirs.quarantine).is_empty());
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::always(Step::Exit(2)));
    let dispatcher = start(&engine, &dirs, dispatcher_config(1));

    let job = dirs.watched_job("broken.pdf", b"%PDF-garbage");
    let job_id = job.id;
    let result = dispatcher.submit(job).unwrap().await;

    let failure = result.outcome.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::MalformedInput);
    assert_eq!(result.attempts, 1);
    assert_eq!(engine.calls(), 1);

    let quarantined = list_dir(&dirs.quarantine);
    assert_eq!(
        quarantined,
        vec![
            format!("{job_id}-broken.pdf"),
            format!("{job_id}-broken.pdf.error.json"),
        ]
    );
    assert!(list_dir(&dirs.output).is_empty());
}

#[tokio::test]
async fn test_transient_failure_retries_up_to_limit() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::always(Step::Signal));
    let dispatcher = start(&engine, &dirs, dispatcher_config(1));

    let job = dirs.watched_job("huge.pdf", MINIMAL_PDF);
    let job_id = job.id;
    let result = dispatcher.submit(job).unwrap().await;

    assert_eq!(result.outcome.failure().unwrap().kind, FailureKind::ResourceExhausted);
    assert_eq!(result.attempts, 3);
    assert_eq!(engine.calls(), 3);

    let descriptor = dirs.quarantine.join(format!("{job_id}-huge.pdf.error.json"));
    let descriptor: FailureDescriptor =
        serde_json::from_slice(&std::fs::read(descriptor).unwrap()).unwrap();
    assert_eq!(descriptor.job_id, job_id);
    assert_eq!(descriptor.classification, FailureKind::ResourceExhausted);
    assert_eq!(descriptor.attempts, 3);
    assert!(list_dir(&dirs.output).is_empty());
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::scripted(vec![Step::Exit(7)], Step::Succeed));
    let dispatcher = start(&engine, &dirs, dispatcher_config(1));

    let result = dispatcher
        .submit(dirs.watched_job("flaky.pdf", MINIMAL_PDF))
        .unwrap()
        .await;

    assert!(result.outcome.is_success());
    assert_eq!(result.attempts, 2);
    assert_eq!(list_dir(&dirs.output), vec!["flaky.pdf"]);
    assert!(list_dir(&dirs.quarantine).is_empty());
}

#[tokio::test]
async fn test_timeout_frees_slot_for_next_job() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::scripted(vec![Step::Hang], Step::Succeed));
    let mut config = dispatcher_config(1);
    config.job_timeout = Duration::from_millis(200);
    config.max_attempts = 1;
    let dispatcher = start(&engine, &dirs, config);

    let started = Instant::now();
    let stuck = dispatcher.submit(dirs.watched_job("stuck.pdf", MINIMAL_PDF)).unwrap();
    let next = dispatcher.submit(dirs.watched_job("next.pdf", MINIMAL_PDF)).unwrap();

    let stuck = stuck.await;
    assert_eq!(stuck.outcome.failure().unwrap().kind, FailureKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(200));

    let next = next.await;
    assert!(next.outcome.is_success());
    assert!(started.elapsed() < Duration::from_secs(5));

    // The hung invocation was dropped, not left running
    assert_eq!(engine.running(), 0);
    assert_eq!(dispatcher.stats().in_flight, 0);
    assert_eq!(list_dir(&dirs.output), vec!["next.pdf"]);
    assert_eq!(list_dir(&dirs.quarantine).len(), 2);
}

#[tokio::test]
async fn test_missing_output_counts_as_engine_crash() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::always(Step::NoOutput));
    let dispatcher = start(&engine, &dirs, dispatcher_config(1));

    let job = dirs.watched_job("empty.pdf", MINIMAL_PDF);
    let job_id = job.id;
    let result = dispatcher.submit(job).unwrap().await;

    assert_eq!(result.outcome.failure().unwrap().kind, FailureKind::EngineCrash);
    assert_eq!(result.attempts, 3);
    assert!(result.output_path.is_none());
    assert!(list_dir(&dirs.output).is_empty());
    assert!(dirs.quarantine.join(format!("{job_id}-empty.pdf")).exists());
}

#[tokio::test]
async fn test_failed_upload_source_is_deleted_not_quarantined() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::always(Step::Exit(6)));
    let dispatcher = start(&engine, &dirs, dispatcher_config(1));

    let result = dispatcher
        .submit(dirs.upload_job("upload.pdf", MINIMAL_PDF))
        .unwrap()
        .await;

    assert_eq!(result.outcome.failure().unwrap().kind, FailureKind::MalformedInput);
    assert!(list_dir(&dirs.work).is_empty());
    assert!(list_dir(&dirs.quarantine).is_empty());
}

#[tokio::test]
async fn test_cancelled_job_never_reaches_engine() {
    let dirs = TestDirs::new();
    let engine = Arc::new(FakeEngine::succeeding().with_delay(Duration::from_millis(150)));
    let dispatcher = start(&engine, &dirs, dispatcher_config(1));

    let first = dispatcher.submit(dirs.watched_job("first.pdf", MINIMAL_PDF)).unwrap();
    let second = dispatcher.submit(dirs.watched_job("second.pdf", MINIMAL_PDF)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.calls() == 1).await);
    assert!(second.cancel());

    assert!(first.await.outcome.is_success());
    let second = second.await;
    assert_eq!(second.outcome.failure().unwrap().kind, FailureKind::Cancelled);
    assert_eq!(second.attempts, 0);
    assert_eq!(engine.calls(), 1);
    // The cancelled source is left where it was
    assert_eq!(list_dir(&dirs.input), vec!["second.pdf"]);
}
