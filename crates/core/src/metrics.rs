//! Prometheus metrics for the batch engine.
//!
//! This module provides metrics for:
//! - Job outcomes and execution durations
//! - Window occupancy (jobs in flight)
//! - Cache lookups

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// Job Metrics
// =============================================================================

/// Jobs finished, by outcome.
pub static JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("sluice_jobs_total", "Total jobs finished"),
        &["outcome"], // "completed", "failed", "skipped"
    )
    .unwrap()
});

/// Execution duration of dispatched jobs.
pub static JOB_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "sluice_job_duration_seconds",
            "Execution duration of dispatched jobs",
        )
        .buckets(vec![
            0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0,
        ]),
        &["outcome"], // "completed", "failed"
    )
    .unwrap()
});

/// Jobs currently dispatched and not yet finished.
pub static JOBS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "sluice_jobs_in_flight",
        "Number of jobs currently dispatched to an executor",
    )
    .unwrap()
});

/// Job timeouts.
pub static JOB_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("sluice_job_timeouts_total", "Total jobs that hit their deadline"),
        &["executor"],
    )
    .unwrap()
});

// =============================================================================
// Cache Metrics
// =============================================================================

/// Cache lookups by result.
pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("sluice_cache_lookups_total", "Total cache lookups"),
        &["result"], // "hit", "miss", "corrupt", "error"
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    registry.register(Box::new(JOBS_TOTAL.clone())).unwrap();
    registry.register(Box::new(JOB_DURATION.clone())).unwrap();
    registry.register(Box::new(JOBS_IN_FLIGHT.clone())).unwrap();
    registry.register(Box::new(JOB_TIMEOUTS.clone())).unwrap();
    registry.register(Box::new(CACHE_LOOKUPS.clone())).unwrap();
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
