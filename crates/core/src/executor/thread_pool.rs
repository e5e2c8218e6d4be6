//! Thread-pool executor for blocking processors.
//!
//! Jobs are queued to a fixed set of OS threads. There is no way to preempt a
//! thread, so a job that outlives its deadline keeps its thread busy until
//! it returns; the scheduler has already reported it failed by then. Jobs
//! whose caller gave up before a thread picked them up are never started.
//!
//! The scheduler's deadline covers queue time too. With fewer free workers
//! than window slots, a stuck thread can push the jobs waiting behind it past
//! their deadlines, so one overrun may surface as several timeouts.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::traits::{BlockingProcessor, Cancellation, Executor, ExecutorStatus};
use super::{panic_message, PoolStats};
use crate::job::{Job, JobFailure};

struct Task<O> {
    job: Job,
    reply: oneshot::Sender<Result<O, JobFailure>>,
}

/// Runs a [`BlockingProcessor`] on `workers` dedicated threads.
pub struct ThreadPoolExecutor<P: BlockingProcessor> {
    queue: mpsc::Sender<Task<P::Output>>,
    workers: usize,
    stats: Arc<PoolStats>,
}

impl<P: BlockingProcessor> ThreadPoolExecutor<P> {
    /// Starts `workers` threads (minimum 1).
    ///
    /// Threads exit once the executor is dropped and the queue drains.
    pub fn new(processor: P, workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let processor = Arc::new(processor);
        let stats = Arc::new(PoolStats::default());
        let (queue, rx) = mpsc::channel::<Task<P::Output>>();
        let rx = Arc::new(Mutex::new(rx));

        for index in 0..workers {
            let rx = Arc::clone(&rx);
            let processor = Arc::clone(&processor);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(format!("sluice-worker-{}", index))
                .spawn(move || worker_loop(index, rx, processor, stats))?;
        }

        debug!(workers, "Thread pool started");
        Ok(Self {
            queue,
            workers,
            stats,
        })
    }
}

fn worker_loop<P: BlockingProcessor>(
    index: usize,
    rx: Arc<Mutex<mpsc::Receiver<Task<P::Output>>>>,
    processor: Arc<P>,
    stats: Arc<PoolStats>,
) {
    loop {
        let task = rx.lock().recv();
        let Ok(task) = task else {
            trace!(worker = index, "Thread pool worker exiting");
            return;
        };

        if task.reply.is_closed() {
            trace!(worker = index, job_id = %task.job.id, "Dropping abandoned job");
            continue;
        }

        let result = {
            let _active = stats.enter();
            match catch_unwind(AssertUnwindSafe(|| processor.process_blocking(&task.job))) {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(JobFailure::Processor(e.to_string())),
                Err(payload) => Err(JobFailure::Panicked(panic_message(payload))),
            }
        };
        stats.record(&result);

        if task.reply.send(result).is_err() {
            debug!(worker = index, job_id = %task.job.id, "Job finished after its caller gave up");
        }
    }
}

#[async_trait]
impl<P: BlockingProcessor> Executor for ThreadPoolExecutor<P> {
    type Output = P::Output;

    fn name(&self) -> &str {
        "thread_pool"
    }

    fn cancellation(&self) -> Cancellation {
        Cancellation::BestEffort
    }

    fn status(&self) -> ExecutorStatus {
        self.stats
            .to_status(self.name(), self.workers, self.cancellation())
    }

    async fn execute(&self, job: &Job) -> Result<Self::Output, JobFailure> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(Task {
                job: job.clone(),
                reply,
            })
            .map_err(|_| JobFailure::WorkerLost("thread pool shut down".to_string()))?;

        rx.await
            .map_err(|_| JobFailure::WorkerLost("worker thread dropped the job".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProcessorError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Blocking {
        finished: Arc<AtomicUsize>,
    }

    impl BlockingProcessor for Blocking {
        type Output = usize;

        fn name(&self) -> &str {
            "blocking"
        }

        fn process_blocking(&self, job: &Job) -> Result<usize, ProcessorError> {
            match job.id.as_str() {
                "fail" => Err(ProcessorError::failed("no", None)),
                "panic" => panic!("worker panic"),
                "slow" => {
                    std::thread::sleep(Duration::from_millis(300));
                    self.finished.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                }
                other => Ok(other.len()),
            }
        }
    }

    fn pool(workers: usize) -> (ThreadPoolExecutor<Blocking>, Arc<AtomicUsize>) {
        let finished = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPoolExecutor::new(
            Blocking {
                finished: Arc::clone(&finished),
            },
            workers,
        )
        .unwrap();
        (pool, finished)
    }

    #[tokio::test]
    async fn test_runs_jobs_on_threads() {
        let (pool, _) = pool(2);
        assert_eq!(pool.execute(&Job::new("four")).await.unwrap(), 4);
        assert!(matches!(
            pool.execute(&Job::new("fail")).await,
            Err(JobFailure::Processor(_))
        ));
        assert_eq!(pool.status().total_processed, 1);
        assert_eq!(pool.status().cancellation, Cancellation::BestEffort);
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let (pool, _) = pool(1);
        assert!(matches!(
            pool.execute(&Job::new("panic")).await,
            Err(JobFailure::Panicked(_))
        ));
        // The single worker survived.
        assert_eq!(pool.execute(&Job::new("ok")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_timed_out_job_keeps_running() {
        let (pool, finished) = pool(1);
        let job = Job::new("slow");

        let result = tokio::time::timeout(Duration::from_millis(50), pool.execute(&job)).await;
        assert!(result.is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        // The thread is not preempted: the job still completes in the background.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
