//! Execution limits for a batch run.

use std::time::Duration;
use thiserror::Error;

use crate::config::EngineConfig;

/// Errors raised when execution limits are invalid.
///
/// These are the only errors fatal to a whole run; they surface before any
/// job is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// Concurrency must allow at least one in-flight job.
    #[error("max_concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    /// The per-job timeout must be a positive duration.
    #[error("per_job_timeout must be positive, got {0}")]
    InvalidTimeout(String),
}

/// Immutable limits applied to every job in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    max_concurrency: usize,
    max_job_size_bytes: Option<u64>,
    per_job_timeout: Option<Duration>,
}

impl ExecutionLimits {
    /// Creates validated limits.
    pub fn new(
        max_concurrency: usize,
        max_job_size_bytes: Option<u64>,
        per_job_timeout: Option<Duration>,
    ) -> Result<Self, ConfigurationError> {
        if max_concurrency < 1 {
            return Err(ConfigurationError::InvalidConcurrency(max_concurrency));
        }
        if let Some(timeout) = per_job_timeout {
            if timeout.is_zero() {
                return Err(ConfigurationError::InvalidTimeout(format!("{:?}", timeout)));
            }
        }

        Ok(Self {
            max_concurrency,
            max_job_size_bytes,
            per_job_timeout,
        })
    }

    /// Limits with the given concurrency and no size cap or timeout.
    pub fn with_concurrency(max_concurrency: usize) -> Result<Self, ConfigurationError> {
        Self::new(max_concurrency, None, None)
    }

    /// Maximum number of jobs executing at any instant.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Size cap above which jobs are skipped.
    pub fn max_job_size_bytes(&self) -> Option<u64> {
        self.max_job_size_bytes
    }

    /// Deadline applied to each dispatched job.
    pub fn per_job_timeout(&self) -> Option<Duration> {
        self.per_job_timeout
    }

    /// Whether a job of the given declared size may be dispatched.
    ///
    /// Jobs without a declared size always fit.
    pub fn fits(&self, job_size: Option<u64>) -> bool {
        match (self.max_job_size_bytes, job_size) {
            (Some(max), Some(size)) => size <= max,
            _ => true,
        }
    }
}

impl TryFrom<&EngineConfig> for ExecutionLimits {
    type Error = ConfigurationError;

    fn try_from(config: &EngineConfig) -> Result<Self, Self::Error> {
        let timeout = match config.per_job_timeout_secs {
            Some(secs) if !secs.is_finite() || secs <= 0.0 => {
                return Err(ConfigurationError::InvalidTimeout(format!("{}s", secs)));
            }
            Some(secs) => Some(Duration::from_secs_f64(secs)),
            None => None,
        };

        Self::new(config.max_concurrency, config.max_job_size_bytes, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = ExecutionLimits::new(0, None, None).unwrap_err();
        assert_eq!(err, ConfigurationError::InvalidConcurrency(0));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = ExecutionLimits::new(2, None, Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidTimeout(_)));
    }

    #[test]
    fn test_fits() {
        let limits = ExecutionLimits::new(1, Some(10 * 1024 * 1024), None).unwrap();
        assert!(limits.fits(Some(10 * 1024 * 1024)));
        assert!(!limits.fits(Some(11 * 1024 * 1024)));
        assert!(limits.fits(None));

        let unbounded = ExecutionLimits::with_concurrency(4).unwrap();
        assert!(unbounded.fits(Some(u64::MAX)));
    }

    #[test]
    fn test_from_engine_config() {
        let config = EngineConfig::default()
            .with_max_concurrency(3)
            .with_timeout_secs(1.5);
        let limits = ExecutionLimits::try_from(&config).unwrap();
        assert_eq!(limits.max_concurrency(), 3);
        assert_eq!(limits.per_job_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_from_engine_config_negative_timeout() {
        let config = EngineConfig::default().with_timeout_secs(-1.0);
        let err = ExecutionLimits::try_from(&config).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidTimeout(_)));
    }
}
