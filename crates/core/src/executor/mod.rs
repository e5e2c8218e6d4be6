//! Worker-pool backends for the windowed scheduler.
//!
//! Three interchangeable executors share the [`Executor`] contract:
//! - [`CooperativeExecutor`]: async tasks gated by a semaphore, for I/O-bound
//!   jobs. Timeouts abort the task.
//! - [`ProcessPoolExecutor`]: a fixed number of child-process slots running
//!   a [`CommandProcessor`](crate::command::CommandProcessor). Timeouts kill
//!   the child.
//! - [`ThreadPoolExecutor`]: a fixed set of OS threads running a
//!   [`BlockingProcessor`]. Timeouts release the slot but the thread keeps
//!   running the job; see [`Cancellation::BestEffort`].
//!
//! # Example
//!
//! ```ignore
//! use sluice_core::executor::{CooperativeExecutor, Executor};
//!
//! let executor = CooperativeExecutor::new(my_processor, 4);
//! let output = executor.execute(&job).await?;
//! println!("{:?}", executor.status());
//! ```

mod cooperative;
mod error;
mod process_pool;
mod thread_pool;
mod traits;

pub use cooperative::CooperativeExecutor;
pub use error::ProcessorError;
pub use process_pool::ProcessPoolExecutor;
pub use thread_pool::ThreadPoolExecutor;
pub use traits::{BlockingProcessor, Cancellation, Executor, ExecutorStatus, Processor};

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::{JoinError, JoinHandle};

use crate::job::JobFailure;

/// Tracks statistics for a worker pool.
#[derive(Debug, Default)]
struct PoolStats {
    active: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
}

impl PoolStats {
    fn to_status(
        &self,
        name: &str,
        max_concurrent: usize,
        cancellation: Cancellation,
    ) -> ExecutorStatus {
        ExecutorStatus {
            name: name.to_string(),
            active_jobs: self.active.load(Ordering::Relaxed) as usize,
            max_concurrent,
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            cancellation,
        }
    }

    /// Marks a job as running until the returned guard is dropped.
    fn enter(&self) -> ActiveGuard<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard { stats: self }
    }

    fn record<T>(&self, result: &Result<T, JobFailure>) {
        match result {
            Ok(_) => self.total_processed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.total_failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

struct ActiveGuard<'a> {
    stats: &'a PoolStats,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Aborts the wrapped task when dropped, so a timed-out execution future
/// takes its spawned work down with it.
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Maps a spawned task's join result into a job result.
fn join_result<T>(
    result: Result<Result<T, ProcessorError>, JoinError>,
) -> Result<T, JobFailure> {
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(JobFailure::Processor(e.to_string())),
        Err(e) if e.is_panic() => Err(JobFailure::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(JobFailure::WorkerLost(e.to_string())),
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic payload");
    }

    #[test]
    fn test_pool_stats_guard() {
        let stats = PoolStats::default();
        {
            let _guard = stats.enter();
            let status = stats.to_status("test", 2, Cancellation::Guaranteed);
            assert_eq!(status.active_jobs, 1);
        }
        stats.record::<()>(&Err(JobFailure::Processor("x".into())));
        let status = stats.to_status("test", 2, Cancellation::Guaranteed);
        assert_eq!(status.active_jobs, 0);
        assert_eq!(status.total_failed, 1);
    }
}
