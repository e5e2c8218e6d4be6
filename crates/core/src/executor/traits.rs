//! Trait definitions for processors and executors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProcessorError;
use crate::job::{Job, JobFailure};

/// Turns one job into one output.
///
/// Implementations are invoked concurrently and must not assume exclusive
/// access to shared state.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Returns the name of this processor implementation.
    fn name(&self) -> &str;

    /// Processes a single job.
    async fn process(&self, job: &Job) -> Result<Self::Output, ProcessorError>;
}

/// Blocking counterpart of [`Processor`], run on dedicated OS threads.
pub trait BlockingProcessor: Send + Sync + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &str;

    fn process_blocking(&self, job: &Job) -> Result<Self::Output, ProcessorError>;
}

/// What happens to a job's underlying work when its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cancellation {
    /// The work is stopped when the execution future is dropped.
    Guaranteed,
    /// The slot is released but the work keeps running to completion in the
    /// background; resources are not reclaimed until it finishes.
    ///
    /// The deadline counts from dispatch, including time spent waiting for a
    /// free worker. While a timed-out job still holds a worker, jobs queued
    /// behind it can reach their own deadline before starting; those are
    /// reported as timed out and never run.
    BestEffort,
}

/// Status of an executor's worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStatus {
    /// Executor name (e.g. "cooperative", "thread_pool").
    pub name: String,
    /// Number of jobs currently running.
    pub active_jobs: usize,
    /// Maximum concurrent jobs.
    pub max_concurrent: usize,
    /// Total jobs that ran to completion since creation.
    pub total_processed: u64,
    /// Total jobs that failed since creation.
    pub total_failed: u64,
    /// Cancellation behavior on timeout.
    pub cancellation: Cancellation,
}

/// A worker-pool backend the scheduler dispatches jobs to.
///
/// The scheduler enforces deadlines by dropping the future returned from
/// [`execute`](Self::execute). Whether that actually stops the work is
/// reported by [`cancellation`](Self::cancellation): the cooperative and
/// process-pool backends stop it, the thread-pool backend cannot.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &str;

    fn cancellation(&self) -> Cancellation;

    fn status(&self) -> ExecutorStatus;

    /// Executes one job, converting processor errors and panics into
    /// [`JobFailure`]s.
    async fn execute(&self, job: &Job) -> Result<Self::Output, JobFailure>;
}
