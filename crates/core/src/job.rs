//! Job descriptors and per-job outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// One unit of work submitted to the engine.
///
/// Parameters are kept in a `BTreeMap` so iteration order is always sorted,
/// which the cache key derivation relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Identity of the job (file path, URL, ...).
    pub id: String,
    /// Freshness marker (e.g. modification time) used in the cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    /// Declared size in bytes, checked against the size cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Conversion parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Job {
    /// Creates a job with the given identity and nothing else.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            modified: None,
            size_bytes: None,
            params: BTreeMap::new(),
        }
    }

    /// Sets the freshness marker.
    pub fn with_modified(mut self, marker: impl Into<String>) -> Self {
        self.modified = Some(marker.into());
        self
    }

    /// Sets the declared size.
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    /// Adds a conversion parameter, replacing any previous value.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Looks up a conversion parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Why a dispatched job failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobFailure {
    /// The job exceeded its deadline.
    #[error("timeout: job exceeded {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The processor returned an error.
    #[error("{0}")]
    Processor(String),

    /// The processor panicked.
    #[error("panic: {0}")]
    Panicked(String),

    /// The worker executing the job went away before reporting.
    #[error("worker lost: {0}")]
    WorkerLost(String),
}

impl JobFailure {
    /// Whether this failure was caused by the per-job deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Why a job was skipped without being dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Declared size is above the configured cap.
    TooLarge { size_bytes: u64, max_bytes: u64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge {
                size_bytes,
                max_bytes,
            } => write!(
                f,
                "job size {} bytes exceeds limit of {} bytes",
                size_bytes, max_bytes
            ),
        }
    }
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum JobOutcome<O> {
    /// The processor produced an output (or it came from the cache).
    Success(O),
    /// The job was dispatched and failed.
    Failed(JobFailure),
    /// The job was never dispatched.
    Skipped(SkipReason),
}

impl<O> JobOutcome<O> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    /// Returns the output if the job succeeded.
    pub fn output(&self) -> Option<&O> {
        match self {
            Self::Success(output) => Some(output),
            _ => None,
        }
    }

    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

/// A job paired with its outcome, as yielded by a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem<O> {
    /// The job this outcome belongs to.
    pub job: Job,
    /// What happened to it.
    pub outcome: JobOutcome<O>,
    /// Whether the output was served from the cache.
    pub cache_hit: bool,
    /// Time spent executing (zero for cache hits and skips).
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
