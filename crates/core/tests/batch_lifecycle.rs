//! End-to-end batch runs across every executor backend.

use futures::stream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sluice_core::testing::{fixtures, MockProcessor};
use sluice_core::{
    BatchRunner, CachePolicy, ContentCache, CooperativeExecutor, ExecutionLimits, Job, JobFailure,
    JobOutcome, SqliteCacheStore, ThreadPoolExecutor,
};

const MIB: u64 = 1024 * 1024;

fn cooperative(
    processor: &MockProcessor,
    limits: ExecutionLimits,
) -> BatchRunner<CooperativeExecutor<MockProcessor>> {
    BatchRunner::new(
        CooperativeExecutor::new(processor.clone(), limits.max_concurrency()),
        limits,
        Arc::new(ContentCache::in_memory(1024)),
    )
}

#[tokio::test]
async fn test_ten_instant_jobs_all_complete() {
    let processor = MockProcessor::new();
    let runner = cooperative(&processor, ExecutionLimits::with_concurrency(3).unwrap());

    let report = runner
        .run_to_completion(stream::iter(fixtures::numbered_jobs(10)))
        .await;

    assert_eq!(report.snapshot.completed, 10);
    assert_eq!(report.snapshot.failed, 0);
    assert_eq!(report.snapshot.skipped, 0);
    assert_eq!(report.snapshot.success_rate, 100.0);
    assert!(report.snapshot.error_samples.is_empty());
    assert_eq!(processor.invocation_count(), 10);
}

#[tokio::test]
async fn test_single_failure_is_sampled() {
    let processor = MockProcessor::new().fail_on("job-3");
    let runner = cooperative(&processor, ExecutionLimits::with_concurrency(2).unwrap());

    let report = runner
        .run_to_completion(stream::iter(fixtures::numbered_jobs(5)))
        .await;

    assert_eq!(report.snapshot.completed, 4);
    assert_eq!(report.snapshot.failed, 1);
    assert_eq!(report.snapshot.success_rate, 80.0);
    assert_eq!(report.snapshot.error_samples.len(), 1);
    assert!(report.snapshot.error_samples[0].contains("job-3"));

    match &report.item("job-3").unwrap().outcome {
        JobOutcome::Failed(JobFailure::Processor(reason)) => {
            assert_eq!(reason, "mock failure on job-3")
        }
        other => panic!("Expected processor failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_job_never_reaches_processor() {
    let processor = MockProcessor::new();
    let limits = ExecutionLimits::new(2, Some(10 * MIB), None).unwrap();
    let runner = cooperative(&processor, limits);

    let job = fixtures::media_job("/in/huge.wav", 11 * MIB);
    let report = runner.run_to_completion(stream::iter(vec![job])).await;

    assert_eq!(report.snapshot.skipped, 1);
    assert_eq!(report.snapshot.total, 1);
    assert_eq!(report.snapshot.success_rate, 0.0);
    assert_eq!(processor.invocation_count(), 0);
}

#[tokio::test]
async fn test_repeated_job_served_from_cache() {
    let processor = MockProcessor::new();
    let runner = cooperative(&processor, ExecutionLimits::with_concurrency(4).unwrap());
    let job = fixtures::media_job("/in/song.flac", 2048);

    let first = runner.run_to_completion(stream::iter(vec![job.clone()])).await;
    let second = runner.run_to_completion(stream::iter(vec![job])).await;

    assert_eq!(processor.invocation_count(), 1);
    assert_eq!(
        first.into_outcomes(),
        vec![JobOutcome::Success("processed:/in/song.flac".to_string())]
    );
    assert!(second.items[0].cache_hit);
    assert_eq!(
        second.items[0].outcome.output().map(String::as_str),
        Some("processed:/in/song.flac")
    );
}

#[tokio::test]
async fn test_changed_param_executes_again() {
    let processor = MockProcessor::new();
    let runner = cooperative(&processor, ExecutionLimits::with_concurrency(2).unwrap());
    let job = Job::new("/in/a.flac").with_param("bitrate", "320");

    runner.run_to_completion(stream::iter(vec![job.clone()])).await;
    runner
        .run_to_completion(stream::iter(vec![job.with_param("bitrate", "192")]))
        .await;

    assert_eq!(processor.invocation_count(), 2);
    assert_eq!(runner.cache().len(), 2);
}

#[tokio::test]
async fn test_window_bound_holds_with_mixed_outcomes() {
    let processor = MockProcessor::new()
        .with_delay(Duration::from_millis(5))
        .fail_on("job-7")
        .panic_on("job-13");
    // Executor with more slots than the window so the window is the only limit.
    let limits = ExecutionLimits::new(4, Some(500), None).unwrap();
    let runner = BatchRunner::new(
        CooperativeExecutor::new(processor.clone(), 64),
        limits,
        Arc::new(ContentCache::in_memory(1024)),
    );

    let jobs = (1..=40).map(|i| {
        let size = if i % 10 == 0 { 1000 } else { 100 };
        Job::new(format!("job-{}", i)).with_size(size)
    });
    let report = runner.run_to_completion(stream::iter(jobs)).await;

    let s = &report.snapshot;
    assert!(processor.peak_concurrency() <= 4);
    assert_eq!(s.total, 40);
    assert_eq!(s.completed + s.failed + s.skipped, s.total);
    assert_eq!(s.skipped, 4);
    assert_eq!(s.failed, 2);
    assert_eq!(s.completed, 34);
    assert_eq!(s.pending, 0);
    assert_eq!(report.items.len(), 40);
}

#[tokio::test]
async fn test_cooperative_timeout_reported_promptly() {
    let processor = MockProcessor::new().stall_on("job-2", Duration::from_secs(30));
    let limits = ExecutionLimits::new(2, None, Some(Duration::from_millis(200))).unwrap();
    let runner = cooperative(&processor, limits);

    let started = Instant::now();
    let report = runner
        .run_to_completion(stream::iter(fixtures::numbered_jobs(3)))
        .await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.snapshot.completed, 2);
    assert_eq!(report.snapshot.failed, 1);
    assert!(report.snapshot.error_samples[0].contains("timeout"));
    assert!(report.item("job-2").unwrap().outcome.is_failed());
    // Aborted: the stalled job is no longer inside the processor.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processor.active(), 0);
}

#[tokio::test]
async fn test_thread_pool_backend() {
    let processor = MockProcessor::new()
        .with_delay(Duration::from_millis(5))
        .fail_on("job-2")
        .panic_on("job-5");
    let limits = ExecutionLimits::with_concurrency(3).unwrap();
    let runner = BatchRunner::new(
        ThreadPoolExecutor::new(processor.clone(), 3).unwrap(),
        limits,
        Arc::new(ContentCache::in_memory(64)),
    );

    let report = runner
        .run_to_completion(stream::iter(fixtures::numbered_jobs(12)))
        .await;

    assert_eq!(report.snapshot.completed, 10);
    assert_eq!(report.snapshot.failed, 2);
    assert!(processor.peak_concurrency() <= 3);
    assert!(matches!(
        report.item("job-5").unwrap().outcome,
        JobOutcome::Failed(JobFailure::Panicked(_))
    ));
}

#[tokio::test]
async fn test_thread_pool_timeout_frees_window() {
    // One stuck job keeps its thread, the other worker carries on.
    let processor = MockProcessor::new().stall_on("job-1", Duration::from_millis(1500));
    let limits = ExecutionLimits::new(2, None, Some(Duration::from_millis(100))).unwrap();
    let runner = BatchRunner::new(
        ThreadPoolExecutor::new(processor.clone(), 2).unwrap(),
        limits,
        Arc::new(ContentCache::in_memory(64)),
    );

    let started = Instant::now();
    let report = runner
        .run_to_completion(stream::iter(fixtures::numbered_jobs(4)))
        .await;

    assert!(started.elapsed() < Duration::from_millis(1400));
    assert_eq!(report.snapshot.failed, 1);
    assert_eq!(report.snapshot.completed, 3);
    assert!(matches!(
        report.item("job-1").unwrap().outcome,
        JobOutcome::Failed(JobFailure::Timeout(_))
    ));
}

#[tokio::test]
async fn test_thread_pool_deadline_includes_queue_wait() {
    // Window wider than the pool: the second job waits behind a stuck thread.
    let processor = MockProcessor::new()
        .stall_on("job-1", Duration::from_millis(500))
        .stall_on("job-2", Duration::from_millis(500));
    let limits = ExecutionLimits::new(2, None, Some(Duration::from_millis(100))).unwrap();
    let runner = BatchRunner::new(
        ThreadPoolExecutor::new(processor.clone(), 1).unwrap(),
        limits,
        Arc::new(ContentCache::in_memory(64)),
    );

    let report = runner
        .run_to_completion(stream::iter(fixtures::numbered_jobs(2)))
        .await;

    assert_eq!(report.snapshot.failed, 2);
    for item in &report.items {
        assert!(matches!(
            item.outcome,
            JobOutcome::Failed(JobFailure::Timeout(_))
        ));
    }

    // The queued job expired before a worker was free, so it never runs.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(processor.invocation_count(), 1);
}

#[tokio::test]
async fn test_streaming_source_yields_before_next_job() {
    let processor = MockProcessor::new();
    let runner = cooperative(&processor, ExecutionLimits::with_concurrency(4).unwrap());
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let source = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|job| (job, rx))
    })
    .boxed();
    let mut batch = runner.run(source);

    for i in 0..3 {
        tx.send(Job::new(format!("job-{}", i))).unwrap();
        let item = tokio::time::timeout(Duration::from_secs(2), batch.next())
            .await
            .expect("each job should finish before the next arrives")
            .unwrap();
        assert_eq!(item.job.id, format!("job-{}", i));
    }

    drop(tx);
    assert!(batch.next().await.is_none());
    assert_eq!(batch.snapshot().completed, 3);
}

#[tokio::test]
async fn test_sqlite_cache_survives_runner() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cache.db");
    let processor = MockProcessor::new();
    let job = fixtures::media_job("/in/a.flac", 10);

    for _ in 0..2 {
        let store = SqliteCacheStore::new(&path, CachePolicy::default()).unwrap();
        let runner = BatchRunner::new(
            CooperativeExecutor::new(processor.clone(), 1),
            ExecutionLimits::with_concurrency(1).unwrap(),
            Arc::new(ContentCache::new(store)),
        );
        let report = runner.run_to_completion(stream::iter(vec![job.clone()])).await;
        assert_eq!(report.snapshot.completed, 1);
    }

    assert_eq!(processor.invocation_count(), 1);
}

#[tokio::test]
async fn test_progress_observed_over_channel() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let runner = cooperative(&MockProcessor::new(), ExecutionLimits::with_concurrency(2).unwrap())
        .with_observer(sluice_core::ChannelObserver::new(tx));

    let report = runner
        .run_to_completion(stream::iter(fixtures::numbered_jobs(5)))
        .await;
    drop(runner);

    let mut last = None;
    while let Some(snapshot) = rx.recv().await {
        last = Some(snapshot);
    }
    let last = last.unwrap();
    assert_eq!(last.completed, 5);
    assert_eq!(last.completed, report.snapshot.completed);
}

#[tokio::test]
async fn test_unbounded_source_consumed_lazily() {
    let processor = MockProcessor::new().with_delay(Duration::from_millis(2));
    let runner = cooperative(&processor, ExecutionLimits::with_concurrency(3).unwrap());

    let endless = stream::iter((0u64..).map(|i| Job::new(format!("job-{}", i))));
    let taken: Vec<_> = runner.run(endless).take(25).collect().await;

    assert_eq!(taken.len(), 25);
    // Never more than the window ahead of what was consumed.
    assert!(processor.invocation_count() <= 25 + 3);
}
