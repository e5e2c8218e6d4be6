//! Process-pool executor: every job runs in its own child process.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use super::traits::{Cancellation, Executor, ExecutorStatus, Processor};
use super::{join_result, AbortOnDrop, PoolStats};
use crate::command::{CommandOutput, CommandProcessor};
use crate::job::{Job, JobFailure};

/// Runs jobs as child processes through a fixed number of process slots.
///
/// Each slot holds at most one child at a time. A crashing or stuck job
/// cannot touch the scheduler's memory, and dropping an execution kills its
/// child process.
pub struct ProcessPoolExecutor {
    command: Arc<CommandProcessor>,
    slots: Arc<Semaphore>,
    size: usize,
    stats: Arc<PoolStats>,
}

impl ProcessPoolExecutor {
    /// Creates a pool with `size` process slots (minimum 1).
    pub fn new(command: CommandProcessor, size: usize) -> Self {
        let size = size.max(1);
        Self {
            command: Arc::new(command),
            slots: Arc::new(Semaphore::new(size)),
            size,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn command(&self) -> &CommandProcessor {
        &self.command
    }
}

#[async_trait]
impl Executor for ProcessPoolExecutor {
    type Output = CommandOutput;

    fn name(&self) -> &str {
        "process_pool"
    }

    fn cancellation(&self) -> Cancellation {
        Cancellation::Guaranteed
    }

    fn status(&self) -> ExecutorStatus {
        self.stats
            .to_status(self.name(), self.size, self.cancellation())
    }

    async fn execute(&self, job: &Job) -> Result<CommandOutput, JobFailure> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| JobFailure::WorkerLost("process pool closed".to_string()))?;

        let _active = self.stats.enter();
        let command = Arc::clone(&self.command);
        let task_job = job.clone();
        debug!(job_id = %job.id, program = %command.spec().program, "Starting worker process");

        // The child is owned by the task; aborting the task drops it, and
        // `kill_on_drop` then kills the process.
        let mut task = AbortOnDrop(tokio::spawn(async move {
            let _slot = slot;
            Processor::process(command.as_ref(), &task_job).await
        }));

        let result = join_result((&mut task.0).await);
        self.stats.record(&result);
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_runs_command() {
        let pool = ProcessPoolExecutor::new(
            CommandProcessor::new(CommandSpec::new("echo").with_args(["converted", "{input}"])),
            2,
        );
        let output = pool.execute(&Job::new("a.wav")).await.unwrap();
        assert_eq!(output.stdout.trim(), "converted a.wav");
        assert_eq!(pool.status().total_processed, 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let pool = ProcessPoolExecutor::new(
            CommandProcessor::new(CommandSpec::new("sh").with_args(["-c", "exit 7"])),
            1,
        );
        let err = pool.execute(&Job::new("a")).await.unwrap_err();
        match err {
            JobFailure::Processor(reason) => assert!(reason.contains("exited with code 7")),
            other => panic!("Expected processor failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1; touch {}", marker.display());
        let pool = ProcessPoolExecutor::new(
            CommandProcessor::new(CommandSpec::new("sh").with_args(["-c", script.as_str()])),
            1,
        );

        let started = Instant::now();
        let result =
            tokio::time::timeout(Duration::from_millis(100), pool.execute(&Job::new("a"))).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_millis(900));

        // Killed: the script never reaches its last command.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
        assert_eq!(pool.slots.available_permits(), 1);
    }
}
