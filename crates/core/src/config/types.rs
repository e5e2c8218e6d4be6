use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub processor: CommandConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Execution engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum number of jobs executing at once (default: 4)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Jobs whose declared size exceeds this are skipped
    #[serde(default)]
    pub max_job_size_bytes: Option<u64>,
    /// Deadline per dispatched job, in seconds
    #[serde(default)]
    pub per_job_timeout_secs: Option<f64>,
    /// Execution backend (default: cooperative)
    #[serde(default)]
    pub backend: ExecutorBackend,
    /// Minimum interval between progress log lines (default: 1000)
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_job_size_bytes: None,
            per_job_timeout_secs: None,
            backend: ExecutorBackend::default(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_job_size_bytes(mut self, bytes: u64) -> Self {
        self.max_job_size_bytes = Some(bytes);
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.per_job_timeout_secs = Some(secs);
        self
    }

    pub fn with_backend(mut self, backend: ExecutorBackend) -> Self {
        self.backend = backend;
        self
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    1000
}

/// Available execution backends
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorBackend {
    /// Async tasks on the runtime
    #[default]
    Cooperative,
    /// Dedicated OS threads
    ThreadPool,
    /// One child process per job
    ProcessPool,
}

/// Result cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Entries kept before least-recently-used eviction (default: 10000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Entry lifetime in seconds; unset means entries never expire
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Database path for the sqlite backend
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            max_entries: default_max_entries(),
            ttl_secs: None,
            path: default_cache_path(),
        }
    }
}

fn default_max_entries() -> usize {
    10_000
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("sluice-cache.db")
}

/// Available cache stores
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Directory job source configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Directory to walk (default: ".")
    #[serde(default = "default_source_root")]
    pub root: PathBuf,
    /// Lowercase extensions to include; empty means every file
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Descend into subdirectories (default: true)
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    /// Parameters attached to every job; part of the cache key
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: default_source_root(),
            extensions: Vec::new(),
            recursive: default_recursive(),
            params: BTreeMap::new(),
        }
    }
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_recursive() -> bool {
    true
}

/// External command run for every job
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandConfig {
    /// Program to execute; required by the CLI
    #[serde(default)]
    pub program: String,
    /// Arguments; `{input}` and `{param:NAME}` are substituted
    #[serde(default = "default_command_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: default_command_args(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

fn default_command_args() -> Vec<String> {
    vec!["{input}".to_string()]
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// What the CLI emits at the end of a run
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Write the Prometheus text exposition here after the run
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
    /// Exit with status 2 when any job failed
    #[serde(default)]
    pub fail_on_error: bool,
}
