//! Windowed scheduler: bounded pipelining over an executor.
//!
//! The scheduler keeps at most `max_concurrency` dispatches outstanding.
//! Whenever one finishes it is handed back to the caller and the window can
//! be refilled by exactly one job, so the number of jobs in flight stays at
//! `min(max_concurrency, remaining)` and the source is pulled lazily.
//!
//! Each dispatch is spawned onto the runtime, so jobs run while the caller is
//! waiting on a slow source. Results come back in completion order, not
//! submission order.

use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::executor::{panic_message, AbortOnDrop, Executor};
use crate::job::{Job, JobFailure};
use crate::limits::ExecutionLimits;
use crate::metrics;

/// A dispatched job that has finished, failed or timed out.
#[derive(Debug)]
pub struct Completed<O> {
    pub job: Job,
    pub result: Result<O, JobFailure>,
    /// Time from dispatch to completion.
    pub duration: Duration,
}

/// What [`WindowedScheduler::next_event`] observed first.
#[derive(Debug)]
pub enum SchedulerEvent<O> {
    /// The source produced a job and the window has room for it.
    Pulled(Job),
    /// The source returned `None`.
    SourceExhausted,
    /// An in-flight job finished.
    Completed(Completed<O>),
    /// Nothing left in flight and nothing more to pull.
    Drained,
}

type Dispatch<O> = Pin<Box<dyn Future<Output = Completed<O>> + Send>>;

/// Keeps the in-flight gauge accurate even if a dispatch is aborted.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::JOBS_IN_FLIGHT.inc();
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::JOBS_IN_FLIGHT.dec();
    }
}

/// Window of in-flight jobs over an executor.
///
/// Dropping the scheduler aborts everything still in flight.
pub struct WindowedScheduler<E: Executor> {
    executor: Arc<E>,
    limits: ExecutionLimits,
    window: FuturesUnordered<Dispatch<E::Output>>,
}

impl<E: Executor> WindowedScheduler<E> {
    pub fn new(executor: Arc<E>, limits: ExecutionLimits) -> Self {
        Self {
            executor,
            limits,
            window: FuturesUnordered::new(),
        }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Maximum number of jobs in flight.
    pub fn capacity(&self) -> usize {
        self.limits.max_concurrency()
    }

    /// Number of dispatched jobs that have not completed.
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.window.len() < self.capacity()
    }

    pub fn is_idle(&self) -> bool {
        self.window.is_empty()
    }

    /// Starts a job and adds it to the window.
    ///
    /// Returns the job back if the window is full. Execution begins right
    /// away on the Tokio runtime; the per-job deadline counts from here.
    pub fn dispatch(&mut self, job: Job) -> Result<(), Job> {
        if !self.has_capacity() {
            return Err(job);
        }

        debug!(
            job_id = %job.id,
            executor = self.executor.name(),
            in_flight = self.window.len() + 1,
            "Dispatching job"
        );

        let started = Instant::now();
        let mut handle = AbortOnDrop(tokio::spawn(execute_with_deadline(
            Arc::clone(&self.executor),
            job.clone(),
            self.limits.per_job_timeout(),
        )));

        self.window.push(Box::pin(async move {
            let result = match (&mut handle.0).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    Err(JobFailure::Panicked(panic_message(e.into_panic())))
                }
                Err(e) => Err(JobFailure::WorkerLost(e.to_string())),
            };

            Completed {
                job,
                result,
                duration: started.elapsed(),
            }
        }));

        Ok(())
    }

    /// Waits for any in-flight job to finish.
    ///
    /// Returns `None` when the window is empty.
    pub async fn next_completed(&mut self) -> Option<Completed<E::Output>> {
        self.window.next().await
    }

    /// Waits on the source and the window together.
    ///
    /// The source is only polled while the window has room and `exhausted`
    /// is false. Completions win when both are ready.
    pub async fn next_event<S>(
        &mut self,
        source: &mut S,
        exhausted: bool,
    ) -> SchedulerEvent<E::Output>
    where
        S: Stream<Item = Job> + Unpin,
    {
        if exhausted || !self.has_capacity() {
            return match self.window.next().await {
                Some(completed) => SchedulerEvent::Completed(completed),
                None => SchedulerEvent::Drained,
            };
        }

        if self.window.is_empty() {
            return pulled(source.next().await);
        }

        tokio::select! {
            biased;
            Some(completed) = self.window.next() => SchedulerEvent::Completed(completed),
            job = source.next() => pulled(job),
        }
    }

    /// Runs every job of `source` through the window.
    ///
    /// Refills one slot per pulled job and yields each completion as soon as
    /// it lands, until the source is exhausted and the window drains.
    pub fn run<S>(self, source: S) -> impl Stream<Item = Completed<E::Output>> + Send
    where
        S: Stream<Item = Job> + Send + Unpin + 'static,
    {
        stream::unfold(
            (self, source, false),
            |(mut scheduler, mut source, mut exhausted)| async move {
                loop {
                    match scheduler.next_event(&mut source, exhausted).await {
                        SchedulerEvent::Pulled(job) => {
                            let dispatched = scheduler.dispatch(job);
                            debug_assert!(
                                dispatched.is_ok(),
                                "pulled only while the window has room"
                            );
                        }
                        SchedulerEvent::SourceExhausted => exhausted = true,
                        SchedulerEvent::Completed(completed) => {
                            return Some((completed, (scheduler, source, exhausted)));
                        }
                        SchedulerEvent::Drained => return None,
                    }
                }
            },
        )
    }
}

fn pulled<O>(job: Option<Job>) -> SchedulerEvent<O> {
    match job {
        Some(job) => SchedulerEvent::Pulled(job),
        None => SchedulerEvent::SourceExhausted,
    }
}

/// Runs one job on `executor`, failing it with a timeout past `deadline`.
async fn execute_with_deadline<E: Executor>(
    executor: Arc<E>,
    job: Job,
    deadline: Option<Duration>,
) -> Result<E::Output, JobFailure> {
    let _in_flight = InFlight::enter();
    let Some(limit) = deadline else {
        return executor.execute(&job).await;
    };

    match tokio::time::timeout(limit, executor.execute(&job)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                job_id = %job.id,
                timeout_ms = limit.as_millis() as u64,
                cancellation = ?executor.cancellation(),
                "Job exceeded its deadline"
            );
            metrics::JOB_TIMEOUTS
                .with_label_values(&[executor.name()])
                .inc();
            Err(JobFailure::Timeout(limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CooperativeExecutor;
    use crate::testing::MockProcessor;
    use futures::stream;

    fn jobs(n: usize) -> Vec<Job> {
        (0..n).map(|i| Job::new(format!("job-{}", i))).collect()
    }

    #[tokio::test]
    async fn test_dispatch_respects_capacity() {
        let executor = Arc::new(CooperativeExecutor::new(MockProcessor::new(), 8));
        let mut scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(2).unwrap());

        assert!(scheduler.dispatch(Job::new("a")).is_ok());
        assert!(scheduler.dispatch(Job::new("b")).is_ok());
        let rejected = scheduler.dispatch(Job::new("c")).unwrap_err();
        assert_eq!(rejected.id, "c");
        assert_eq!(scheduler.in_flight(), 2);

        let first = scheduler.next_completed().await.unwrap();
        assert!(first.result.is_ok());
        assert!(scheduler.has_capacity());
    }

    #[tokio::test]
    async fn test_empty_window_returns_none() {
        let executor = Arc::new(CooperativeExecutor::new(MockProcessor::new(), 1));
        let mut scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(1).unwrap());
        assert!(scheduler.next_completed().await.is_none());
    }

    #[tokio::test]
    async fn test_run_never_exceeds_window() {
        let processor = MockProcessor::new().with_delay(Duration::from_millis(10));
        // Executor slots above the window so only the window limits concurrency.
        let executor = Arc::new(CooperativeExecutor::new(processor.clone(), 64));
        let scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(3).unwrap());

        let completed: Vec<_> = scheduler.run(stream::iter(jobs(20))).collect().await;

        assert_eq!(completed.len(), 20);
        assert!(completed.iter().all(|c| c.result.is_ok()));
        assert_eq!(processor.invocation_count(), 20);
        assert!(processor.peak_concurrency() <= 3);
        assert!(processor.peak_concurrency() >= 2);
    }

    #[tokio::test]
    async fn test_results_in_completion_order() {
        let processor = MockProcessor::new()
            .stall_on("slow", Duration::from_millis(200))
            .with_delay(Duration::from_millis(5));
        let executor = Arc::new(CooperativeExecutor::new(processor, 4));
        let scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(2).unwrap());

        let source = stream::iter(vec![Job::new("slow"), Job::new("fast-1"), Job::new("fast-2")]);
        let order: Vec<String> = scheduler.run(source).map(|c| c.job.id).collect().await;

        assert_eq!(order.len(), 3);
        assert_eq!(order.last().map(String::as_str), Some("slow"));
    }

    #[tokio::test]
    async fn test_timeout_frees_slot() {
        let processor = MockProcessor::new().stall_on("stuck", Duration::from_secs(30));
        let executor = Arc::new(CooperativeExecutor::new(processor.clone(), 1));
        let limits = ExecutionLimits::new(1, None, Some(Duration::from_millis(100))).unwrap();
        let scheduler = WindowedScheduler::new(executor, limits);

        let started = Instant::now();
        let source = stream::iter(vec![Job::new("stuck"), Job::new("after")]);
        let completed: Vec<_> = scheduler.run(source).collect().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(completed.len(), 2);
        assert!(matches!(
            completed[0].result,
            Err(JobFailure::Timeout(limit)) if limit == Duration::from_millis(100)
        ));
        assert_eq!(completed[1].job.id, "after");
        assert!(completed[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_completes_while_source_pending() {
        let processor = MockProcessor::new();
        let executor = Arc::new(CooperativeExecutor::new(processor.clone(), 2));
        let scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(2).unwrap());

        // One job, then a source that never yields again.
        let source = stream::iter(vec![Job::new("job-1")]).chain(stream::pending());
        let mut run = Box::pin(scheduler.run(source));

        let completed = tokio::time::timeout(Duration::from_secs(2), run.next())
            .await
            .expect("completion should not wait on the source")
            .unwrap();
        assert_eq!(completed.job.id, "job-1");
        assert!(completed.result.is_ok());
        assert_eq!(processor.invocation_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_starts_execution() {
        let processor = MockProcessor::new();
        let executor = Arc::new(CooperativeExecutor::new(processor.clone(), 1));
        let mut scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(1).unwrap());

        scheduler.dispatch(Job::new("eager")).unwrap();
        // Never polled through the window.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.invocation_count(), 1);
    }

    #[tokio::test]
    async fn test_next_event_prefers_completions() {
        let executor = Arc::new(CooperativeExecutor::new(MockProcessor::new(), 2));
        let mut scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(2).unwrap());
        let mut source = stream::iter(vec![Job::new("a"), Job::new("b")]);

        match scheduler.next_event(&mut source, false).await {
            SchedulerEvent::Pulled(job) => scheduler.dispatch(job).unwrap(),
            other => panic!("Expected a pulled job, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            scheduler.next_event(&mut source, false).await,
            SchedulerEvent::Completed(c) if c.job.id == "a"
        ));
        assert!(matches!(
            scheduler.next_event(&mut source, true).await,
            SchedulerEvent::Drained
        ));
    }

    #[tokio::test]
    async fn test_dropping_scheduler_aborts_in_flight() {
        let processor = MockProcessor::new().stall_on("stuck", Duration::from_secs(30));
        let executor = Arc::new(CooperativeExecutor::new(processor.clone(), 1));
        let mut scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(1).unwrap());

        scheduler.dispatch(Job::new("stuck")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(processor.active(), 1);

        drop(scheduler);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.active(), 0);
    }

    #[tokio::test]
    async fn test_pulls_source_lazily() {
        let processor = MockProcessor::new().with_delay(Duration::from_millis(5));
        let executor = Arc::new(CooperativeExecutor::new(processor, 2));
        let scheduler =
            WindowedScheduler::new(executor, ExecutionLimits::with_concurrency(2).unwrap());

        // An endless source: only what is consumed is ever pulled.
        let endless = stream::iter((0..).map(|i| Job::new(format!("job-{}", i))));
        let first_five: Vec<_> = scheduler.run(endless).take(5).collect().await;
        assert_eq!(first_five.len(), 5);
    }
}
