//! Error types for processors.

use thiserror::Error;

/// Errors a processor may return for a single job.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The job ran and failed.
    #[error("{reason}")]
    Failed {
        reason: String,
        stderr: Option<String>,
    },

    /// The job descriptor cannot be processed as given.
    #[error("Invalid job: {reason}")]
    InvalidJob { reason: String },

    /// A worker process could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while processing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessorError {
    /// Creates a failure with optional captured stderr.
    pub fn failed(reason: impl Into<String>, stderr: Option<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            stderr,
        }
    }

    /// Creates an invalid job error.
    pub fn invalid_job(reason: impl Into<String>) -> Self {
        Self::InvalidJob {
            reason: reason.into(),
        }
    }
}
