//! Live progress counters and snapshots for a batch run.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Maximum number of error reasons kept for diagnostics.
pub const ERROR_SAMPLE_CAPACITY: usize = 10;

/// Point-in-time view of a run's progress.
///
/// Serializes to a flat record suitable for dashboards and CLI output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Jobs known to the run (expected total, or discovered so far).
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Jobs known but without an outcome yet.
    pub pending: u64,
    /// `completed / (completed + failed) * 100`, or 0 with no finished jobs.
    pub success_rate: f64,
    /// Wall-clock time since the tracker was created.
    pub elapsed_seconds: f64,
    /// Outcomes recorded per second of elapsed time.
    pub items_per_second: f64,
    /// The first failure reasons, at most [`ERROR_SAMPLE_CAPACITY`].
    pub error_samples: Vec<String>,
}

impl ProgressSnapshot {
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_seconds.max(0.0))
    }

    /// Jobs with a recorded outcome.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }
}

/// Thread-safe outcome counters.
///
/// Each job must be recorded exactly once via one of the `record_*`
/// methods. Counters are atomics so [`snapshot`](Self::snapshot) never waits
/// on writers; only the error sample list takes a short lock.
#[derive(Debug)]
pub struct ProgressTracker {
    started_at: Instant,
    expected_total: Option<u64>,
    discovered: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    error_samples: Mutex<Vec<String>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Creates a tracker for a source of unknown length.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            expected_total: None,
            discovered: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            error_samples: Mutex::new(Vec::with_capacity(ERROR_SAMPLE_CAPACITY)),
        }
    }

    /// Creates a tracker for a source with a known number of jobs.
    pub fn with_expected_total(total: u64) -> Self {
        Self {
            expected_total: Some(total),
            ..Self::new()
        }
    }

    /// Notes that a job was pulled from the source.
    ///
    /// Only feeds `total`/`pending`; outcomes are recorded separately.
    pub fn record_discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failure and keeps its reason if the sample buffer has room.
    pub fn record_failed(&self, reason: impl Into<String>) {
        {
            let mut samples = self.error_samples.lock();
            if samples.len() < ERROR_SAMPLE_CAPACITY {
                samples.push(reason.into());
            }
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a skip. Skip reasons are not sampled.
    pub fn record_skipped(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::trace!(reason = %reason, "Job skipped");
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Computes a snapshot from the current counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        let discovered = self.discovered.load(Ordering::Relaxed);

        let finished = completed + failed + skipped;
        let total = self
            .expected_total
            .unwrap_or(0)
            .max(discovered)
            .max(finished);

        let elapsed = self.started_at.elapsed().as_secs_f64();
        let items_per_second = if elapsed > 0.0 {
            finished as f64 / elapsed
        } else {
            0.0
        };

        let attempted = completed + failed;
        let success_rate = if attempted > 0 {
            completed as f64 / attempted as f64 * 100.0
        } else {
            0.0
        };

        ProgressSnapshot {
            total,
            completed,
            failed,
            skipped,
            pending: total - finished,
            success_rate,
            elapsed_seconds: elapsed,
            items_per_second,
            error_samples: self.error_samples.lock().clone(),
        }
    }
}

/// Receives a snapshot after every recorded outcome.
///
/// Called on the coordinating task, so implementations must return quickly.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

/// Forwards snapshots into a channel without blocking.
///
/// Snapshots are dropped while the channel is full; a later one supersedes
/// them anyway.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<ProgressSnapshot>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<ProgressSnapshot>) -> Self {
        Self { tx }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let _ = self.tx.try_send(snapshot.clone());
    }
}
