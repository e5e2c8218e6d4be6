//! Throttled progress logging.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

use sluice_core::{ProgressObserver, ProgressSnapshot};

/// Logs a progress line at most once per `interval`.
pub struct ProgressLogger {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressLogger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Whether a line is due now; claims the slot if so.
    fn due(&self, now: Instant) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(previous) if now.duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl ProgressObserver for ProgressLogger {
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        if !self.due(Instant::now()) {
            return;
        }
        info!(
            finished = snapshot.finished(),
            total = snapshot.total,
            failed = snapshot.failed,
            skipped = snapshot.skipped,
            items_per_second = %format!("{:.2}", snapshot.items_per_second),
            "Progress"
        );
    }
}
