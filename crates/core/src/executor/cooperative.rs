//! Cooperative executor: async tasks behind a counting limiter.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use super::traits::{Cancellation, Executor, ExecutorStatus, Processor};
use super::{join_result, AbortOnDrop, PoolStats};
use crate::job::{Job, JobFailure};

/// Runs an async [`Processor`] as runtime tasks, at most `slots` at a time.
///
/// Best for I/O-bound jobs. Dropping an in-progress execution (e.g. on
/// timeout) aborts its task at the next suspension point.
pub struct CooperativeExecutor<P: Processor> {
    processor: Arc<P>,
    limiter: Arc<Semaphore>,
    slots: usize,
    stats: Arc<PoolStats>,
}

impl<P: Processor> CooperativeExecutor<P> {
    /// Creates an executor allowing `slots` concurrent tasks (minimum 1).
    pub fn new(processor: P, slots: usize) -> Self {
        Self::with_shared(Arc::new(processor), slots)
    }

    /// Creates an executor over a processor shared with other owners.
    pub fn with_shared(processor: Arc<P>, slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            processor,
            limiter: Arc::new(Semaphore::new(slots)),
            slots,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }
}

#[async_trait]
impl<P: Processor> Executor for CooperativeExecutor<P> {
    type Output = P::Output;

    fn name(&self) -> &str {
        "cooperative"
    }

    fn cancellation(&self) -> Cancellation {
        Cancellation::Guaranteed
    }

    fn status(&self) -> ExecutorStatus {
        self.stats
            .to_status(self.name(), self.slots, self.cancellation())
    }

    async fn execute(&self, job: &Job) -> Result<Self::Output, JobFailure> {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| JobFailure::WorkerLost("limiter closed".to_string()))?;

        let _active = self.stats.enter();
        let processor = Arc::clone(&self.processor);
        let task_job = job.clone();
        debug!(job_id = %job.id, processor = processor.name(), "Spawning cooperative task");

        let mut task = AbortOnDrop(tokio::spawn(async move {
            let _permit = permit;
            processor.process(&task_job).await
        }));

        let result = join_result((&mut task.0).await);
        self.stats.record(&result);
        result
    }
}
