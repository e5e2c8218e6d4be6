//! Testing utilities and mock implementations.
//!
//! This module provides a mock processor and job fixtures, allowing batch
//! runs to be exercised without real conversion tools.
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice_core::testing::{fixtures, MockProcessor};
//!
//! let processor = MockProcessor::new().fail_on("job-3");
//! let jobs = fixtures::numbered_jobs(5);
//! ```

mod mock_processor;

pub use mock_processor::MockProcessor;

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::job::Job;

    /// Jobs `job-1` .. `job-n`.
    pub fn numbered_jobs(n: usize) -> Vec<Job> {
        (1..=n).map(|i| Job::new(format!("job-{}", i))).collect()
    }

    /// A job resembling a source media file with size and mtime marker.
    pub fn media_job(path: &str, size_bytes: u64) -> Job {
        Job::new(path)
            .with_size(size_bytes)
            .with_modified("1700000000")
            .with_param("format", "ogg")
    }
}
