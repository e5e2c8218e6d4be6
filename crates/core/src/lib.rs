//! Bounded-concurrency batch execution engine.
//!
//! A [`BatchRunner`] pulls [`Job`]s from a stream, answers repeats from a
//! [`ContentCache`], skips oversized jobs and keeps at most
//! `max_concurrency` of the rest executing through an [`Executor`]. Every
//! job ends in exactly one [`JobOutcome`], and progress is observable
//! through [`ProgressSnapshot`]s while the run is going.

pub mod cache;
pub mod command;
pub mod config;
pub mod executor;
pub mod job;
pub mod limits;
pub mod metrics;
pub mod progress;
pub mod runner;
pub mod scheduler;
pub mod source;
pub mod testing;

pub use cache::{
    CacheEntry, CacheError, CacheKey, CachePolicy, CacheStore, ContentCache, MemoryCacheStore,
    SqliteCacheStore,
};
pub use command::{CommandOutput, CommandProcessor, CommandSpec};
pub use config::{
    load_config, load_config_from_str, validate_config, CacheBackend, Config, ConfigError,
    EngineConfig, ExecutorBackend, LogFormat,
};
pub use executor::{
    BlockingProcessor, Cancellation, CooperativeExecutor, Executor, ExecutorStatus,
    ProcessPoolExecutor, Processor, ProcessorError, ThreadPoolExecutor,
};
pub use job::{BatchItem, Job, JobFailure, JobOutcome, SkipReason};
pub use limits::{ConfigurationError, ExecutionLimits};
pub use progress::{ChannelObserver, ProgressObserver, ProgressSnapshot, ProgressTracker};
pub use runner::{BatchReport, BatchRunner, BatchStream};
pub use scheduler::{Completed, SchedulerEvent, WindowedScheduler};
pub use source::DirectorySource;
