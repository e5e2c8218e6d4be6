//! Mock processor for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::executor::{BlockingProcessor, Processor, ProcessorError};
use crate::job::Job;

#[derive(Debug, Default)]
struct MockState {
    /// Jobs in invocation order.
    invocations: Mutex<Vec<Job>>,
    /// Jobs currently inside the processor.
    active: AtomicUsize,
    /// Highest value `active` ever reached.
    peak: AtomicUsize,
    /// Delay applied to every job without a stall override.
    delay: Mutex<Duration>,
    /// Per-job delays.
    stalls: Mutex<HashMap<String, Duration>>,
    /// Job ids that fail.
    failing: Mutex<HashSet<String>>,
    /// Job ids that panic.
    panicking: Mutex<HashSet<String>>,
}

/// Decrements the active count even if the job is aborted or panics.
struct Entered<'a> {
    state: &'a MockState,
}

impl<'a> Entered<'a> {
    fn new(state: &'a MockState) -> Self {
        let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(now, Ordering::SeqCst);
        Self { state }
    }
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock implementation of the processor traits.
///
/// Provides controllable behavior for testing:
/// - Record invocations for assertions
/// - Simulate per-job failures, panics and stalls
/// - Measure the highest number of jobs processed at once
///
/// Outputs are `"processed:<job id>"`. Clones share state.
///
/// # Example
///
/// ```rust,ignore
/// use sluice_core::testing::MockProcessor;
///
/// let processor = MockProcessor::new()
///     .with_delay(Duration::from_millis(10))
///     .fail_on("job-3");
///
/// // Run a batch...
///
/// assert_eq!(processor.invocation_count(), 5);
/// assert!(processor.peak_concurrency() <= 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockProcessor {
    state: Arc<MockState>,
}

impl MockProcessor {
    /// Create a new mock processor that succeeds instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every job by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock() = delay;
        self
    }

    /// Make the job with this id fail.
    pub fn fail_on(self, job_id: impl Into<String>) -> Self {
        self.state.failing.lock().insert(job_id.into());
        self
    }

    /// Make the job with this id panic.
    pub fn panic_on(self, job_id: impl Into<String>) -> Self {
        self.state.panicking.lock().insert(job_id.into());
        self
    }

    /// Make the job with this id take `duration` instead of the default delay.
    pub fn stall_on(self, job_id: impl Into<String>, duration: Duration) -> Self {
        self.state.stalls.lock().insert(job_id.into(), duration);
        self
    }

    /// Number of times the processor was entered.
    pub fn invocation_count(&self) -> usize {
        self.state.invocations.lock().len()
    }

    /// All jobs the processor was entered with, in order.
    pub fn invocations(&self) -> Vec<Job> {
        self.state.invocations.lock().clone()
    }

    /// Number of invocations for a specific job id.
    pub fn invocations_of(&self, job_id: &str) -> usize {
        self.state
            .invocations
            .lock()
            .iter()
            .filter(|job| job.id == job_id)
            .count()
    }

    /// Highest number of jobs that were inside the processor at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Jobs currently inside the processor.
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Clear recorded invocations and the peak counter.
    pub fn clear_recorded(&self) {
        self.state.invocations.lock().clear();
        self.state.peak.store(0, Ordering::SeqCst);
    }

    fn begin(&self, job: &Job) -> (Entered<'_>, Duration) {
        self.state.invocations.lock().push(job.clone());
        let entered = Entered::new(&self.state);
        let delay = self
            .state
            .stalls
            .lock()
            .get(&job.id)
            .copied()
            .unwrap_or_else(|| *self.state.delay.lock());
        (entered, delay)
    }

    fn finish(&self, job: &Job) -> Result<String, ProcessorError> {
        if self.state.panicking.lock().contains(&job.id) {
            panic!("mock processor panic on {}", job.id);
        }
        if self.state.failing.lock().contains(&job.id) {
            return Err(ProcessorError::failed(
                format!("mock failure on {}", job.id),
                None,
            ));
        }
        Ok(format!("processed:{}", job.id))
    }
}

#[async_trait]
impl Processor for MockProcessor {
    type Output = String;

    fn name(&self) -> &str {
        "mock"
    }

    async fn process(&self, job: &Job) -> Result<String, ProcessorError> {
        let (_entered, delay) = self.begin(job);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.finish(job)
    }
}

impl BlockingProcessor for MockProcessor {
    type Output = String;

    fn name(&self) -> &str {
        "mock"
    }

    fn process_blocking(&self, job: &Job) -> Result<String, ProcessorError> {
        let (_entered, delay) = self.begin(job);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.finish(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_fails() {
        let processor = MockProcessor::new().fail_on("bad");

        assert_eq!(
            Processor::process(&processor, &Job::new("good")).await.unwrap(),
            "processed:good"
        );
        assert!(Processor::process(&processor, &Job::new("bad")).await.is_err());
        assert_eq!(processor.invocation_count(), 2);
        assert_eq!(processor.invocations_of("bad"), 1);
        assert_eq!(processor.active(), 0);
    }

    #[tokio::test]
    async fn test_peak_concurrency() {
        let processor = MockProcessor::new().with_delay(Duration::from_millis(20));
        let a = Job::new("a");
        let b = Job::new("b");
        let (ra, rb) = tokio::join!(
            Processor::process(&processor, &a),
            Processor::process(&processor, &b)
        );
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(processor.peak_concurrency(), 2);

        processor.clear_recorded();
        assert_eq!(processor.invocation_count(), 0);
        assert_eq!(processor.peak_concurrency(), 0);
    }

    #[test]
    fn test_blocking_variant() {
        let processor = MockProcessor::new();
        assert_eq!(
            processor.process_blocking(&Job::new("x")).unwrap(),
            "processed:x"
        );
    }
}
