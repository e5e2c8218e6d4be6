//! Batch runner: cache short-circuit, size screening and windowed dispatch.
//!
//! # Example
//!
//! ```ignore
//! use sluice_core::{BatchRunner, ContentCache, CooperativeExecutor, ExecutionLimits};
//!
//! let limits = ExecutionLimits::new(4, Some(10 * 1024 * 1024), Some(Duration::from_secs(60)))?;
//! let cache = Arc::new(ContentCache::in_memory(10_000));
//! let runner = BatchRunner::new(CooperativeExecutor::new(processor, 4), limits, cache)
//!     .with_observer(|snapshot: &ProgressSnapshot| println!("{}/{}", snapshot.completed, snapshot.total));
//!
//! let report = runner.run_to_completion(futures::stream::iter(jobs)).await;
//! println!("success rate: {:.1}%", report.snapshot.success_rate);
//! ```

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ContentCache;
use crate::config::EngineConfig;
use crate::executor::Executor;
use crate::job::{BatchItem, Job, JobFailure, JobOutcome, SkipReason};
use crate::limits::{ConfigurationError, ExecutionLimits};
use crate::metrics;
use crate::progress::{ProgressObserver, ProgressSnapshot, ProgressTracker};
use crate::scheduler::{Completed, SchedulerEvent, WindowedScheduler};

/// Runs batches of jobs against an executor.
///
/// Every job ends in exactly one outcome: a cache hit or a successful
/// execution is `Success`, an oversized job is `Skipped`, and anything that
/// goes wrong while executing (errors, panics, timeouts) is `Failed` for that
/// job only. Nothing a job does can abort the batch.
pub struct BatchRunner<E: Executor> {
    executor: Arc<E>,
    limits: ExecutionLimits,
    cache: Arc<ContentCache<E::Output>>,
    observer: Option<Arc<dyn ProgressObserver>>,
    expected_total: Option<u64>,
}

impl<E> BatchRunner<E>
where
    E: Executor,
    E::Output: Serialize + DeserializeOwned,
{
    /// Creates a runner. The limits are already validated.
    pub fn new(executor: E, limits: ExecutionLimits, cache: Arc<ContentCache<E::Output>>) -> Self {
        Self::with_shared_executor(Arc::new(executor), limits, cache)
    }

    /// Creates a runner over an executor shared with other owners.
    pub fn with_shared_executor(
        executor: Arc<E>,
        limits: ExecutionLimits,
        cache: Arc<ContentCache<E::Output>>,
    ) -> Self {
        Self {
            executor,
            limits,
            cache,
            observer: None,
            expected_total: None,
        }
    }

    /// Creates a runner, validating limits from engine configuration.
    pub fn from_config(
        executor: E,
        config: &EngineConfig,
        cache: Arc<ContentCache<E::Output>>,
    ) -> Result<Self, ConfigurationError> {
        let limits = ExecutionLimits::try_from(config)?;
        Ok(Self::new(executor, limits, cache))
    }

    /// Sets an observer notified after every recorded outcome.
    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Declares how many jobs the source will produce, for `total`/`pending`.
    pub fn with_expected_total(mut self, total: u64) -> Self {
        self.expected_total = Some(total);
        self
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn cache(&self) -> &Arc<ContentCache<E::Output>> {
        &self.cache
    }

    /// Starts a run over `source` and returns its results as a stream, in
    /// completion order.
    ///
    /// The source is pulled lazily; at most `max_concurrency` jobs are in
    /// flight. Each run gets fresh progress counters.
    pub fn run<S>(&self, source: S) -> BatchStream<E::Output>
    where
        S: Stream<Item = Job> + Send + Unpin + 'static,
    {
        let expected_total = self.expected_total.or_else(|| match source.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower as u64),
            _ => None,
        });
        let tracker = Arc::new(match expected_total {
            Some(total) => ProgressTracker::with_expected_total(total),
            None => ProgressTracker::new(),
        });

        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            executor = self.executor.name(),
            max_concurrency = self.limits.max_concurrency(),
            max_job_size_bytes = ?self.limits.max_job_size_bytes(),
            per_job_timeout = ?self.limits.per_job_timeout(),
            expected_total = ?expected_total,
            "Starting batch run"
        );

        let state = RunState {
            run_id,
            scheduler: WindowedScheduler::new(Arc::clone(&self.executor), self.limits),
            source,
            exhausted: false,
            finished: false,
            limits: self.limits,
            cache: Arc::clone(&self.cache),
            tracker: Arc::clone(&tracker),
            observer: self.observer.clone(),
        };

        let inner = stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })
        .boxed();

        BatchStream {
            run_id,
            tracker,
            inner,
        }
    }

    /// Runs `source` to the end and returns every item plus the final
    /// snapshot.
    pub async fn run_to_completion<S>(&self, source: S) -> BatchReport<E::Output>
    where
        S: Stream<Item = Job> + Send + Unpin + 'static,
    {
        self.run(source).into_report().await
    }
}

/// Results of a run, in completion order.
pub struct BatchStream<O> {
    run_id: Uuid,
    tracker: Arc<ProgressTracker>,
    inner: BoxStream<'static, BatchItem<O>>,
}

impl<O> BatchStream<O> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current progress of this run.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tracker.snapshot()
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Drains the stream into a report.
    pub async fn into_report(mut self) -> BatchReport<O> {
        let mut items = Vec::new();
        while let Some(item) = self.inner.next().await {
            items.push(item);
        }
        BatchReport {
            run_id: self.run_id,
            snapshot: self.tracker.snapshot(),
            items,
        }
    }
}

impl<O> Stream for BatchStream<O> {
    type Item = BatchItem<O>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport<O> {
    pub run_id: Uuid,
    /// Items in completion order.
    pub items: Vec<BatchItem<O>>,
    /// Final statistics.
    pub snapshot: ProgressSnapshot,
}

impl<O> BatchReport<O> {
    /// Outputs of successful jobs, keyed by job id.
    pub fn outputs(&self) -> impl Iterator<Item = (&str, &O)> {
        self.items
            .iter()
            .filter_map(|item| item.outcome.output().map(|output| (item.job.id.as_str(), output)))
    }

    /// Failed jobs with their reasons.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &JobFailure)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            JobOutcome::Failed(failure) => Some((item.job.id.as_str(), failure)),
            _ => None,
        })
    }

    /// Finds the item for a job id.
    pub fn item(&self, job_id: &str) -> Option<&BatchItem<O>> {
        self.items.iter().find(|item| item.job.id == job_id)
    }

    pub fn into_outcomes(self) -> Vec<JobOutcome<O>> {
        self.items.into_iter().map(|item| item.outcome).collect()
    }
}

struct RunState<E: Executor, S> {
    run_id: Uuid,
    scheduler: WindowedScheduler<E>,
    source: S,
    exhausted: bool,
    finished: bool,
    limits: ExecutionLimits,
    cache: Arc<ContentCache<E::Output>>,
    tracker: Arc<ProgressTracker>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl<E, S> RunState<E, S>
where
    E: Executor,
    E::Output: Serialize + DeserializeOwned,
    S: Stream<Item = Job> + Send + Unpin,
{
    /// Produces the next outcome, pulling from the source while the window
    /// has room and handing back completions as soon as they land.
    async fn next_item(&mut self) -> Option<BatchItem<E::Output>> {
        loop {
            match self
                .scheduler
                .next_event(&mut self.source, self.exhausted)
                .await
            {
                SchedulerEvent::Pulled(job) => {
                    if let Some(item) = self.admit(job) {
                        return Some(item);
                    }
                }
                SchedulerEvent::SourceExhausted => {
                    debug!(run_id = %self.run_id, "Job source exhausted");
                    self.exhausted = true;
                }
                SchedulerEvent::Completed(completed) => return Some(self.settle(completed)),
                SchedulerEvent::Drained => {
                    self.finish();
                    return None;
                }
            }
        }
    }

    /// Resolves a job from the cache or the size check, or dispatches it.
    ///
    /// Returns an item only when the job was resolved without dispatch.
    fn admit(&mut self, job: Job) -> Option<BatchItem<E::Output>> {
        self.tracker.record_discovered();

        let key = self.cache.key_for(&job);
        if let Some(value) = self.cache.get(&key) {
            debug!(run_id = %self.run_id, job_id = %job.id, key = %key, "Cache hit");
            self.tracker.record_completed();
            return Some(self.emit(job, JobOutcome::Success(value), true, Duration::ZERO));
        }

        if !self.limits.fits(job.size_bytes) {
            let reason = SkipReason::TooLarge {
                size_bytes: job.size_bytes.unwrap_or_default(),
                max_bytes: self.limits.max_job_size_bytes().unwrap_or_default(),
            };
            debug!(run_id = %self.run_id, job_id = %job.id, reason = %reason, "Skipping job");
            self.tracker.record_skipped(reason.to_string());
            return Some(self.emit(job, JobOutcome::Skipped(reason), false, Duration::ZERO));
        }

        let dispatched = self.scheduler.dispatch(job);
        debug_assert!(
            dispatched.is_ok(),
            "jobs are only pulled while the window has room"
        );
        None
    }

    /// Records a dispatched job's result.
    fn settle(&self, completed: Completed<E::Output>) -> BatchItem<E::Output> {
        let Completed {
            job,
            result,
            duration,
        } = completed;

        let outcome = match result {
            Ok(output) => {
                let key = self.cache.key_for(&job);
                if let Err(e) = self.cache.put(&key, &output) {
                    warn!(run_id = %self.run_id, job_id = %job.id, error = %e, "Failed to cache result");
                }
                debug!(
                    run_id = %self.run_id,
                    job_id = %job.id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                self.tracker.record_completed();
                JobOutcome::Success(output)
            }
            Err(failure) => {
                warn!(
                    run_id = %self.run_id,
                    job_id = %job.id,
                    error = %failure,
                    "Job failed"
                );
                self.tracker.record_failed(format!("{}: {}", job.id, failure));
                JobOutcome::Failed(failure)
            }
        };

        metrics::JOB_DURATION
            .with_label_values(&[outcome.label()])
            .observe(duration.as_secs_f64());
        self.emit(job, outcome, false, duration)
    }

    fn emit(
        &self,
        job: Job,
        outcome: JobOutcome<E::Output>,
        cache_hit: bool,
        duration: Duration,
    ) -> BatchItem<E::Output> {
        metrics::JOBS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        if let Some(observer) = &self.observer {
            observer.on_progress(&self.tracker.snapshot());
        }
        BatchItem {
            job,
            outcome,
            cache_hit,
            duration,
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let snapshot = self.tracker.snapshot();
        info!(
            run_id = %self.run_id,
            total = snapshot.total,
            completed = snapshot.completed,
            failed = snapshot.failed,
            skipped = snapshot.skipped,
            success_rate = snapshot.success_rate,
            elapsed_seconds = snapshot.elapsed_seconds,
            items_per_second = snapshot.items_per_second,
            "Batch run finished"
        );
    }
}
