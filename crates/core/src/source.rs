//! Directory job source.
//!
//! Walks a directory tree lazily, one entry at a time, so a batch can start
//! before the walk is finished and huge trees are never listed up front.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::{self, ReadDir};
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::job::Job;

/// Produces one [`Job`] per matching file under a root directory.
///
/// Each job carries the file path as its id, the file size and the
/// modification time as its freshness marker, so an edited file gets a new
/// cache key. Symlinked files are followed; symlinked directories are not.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    extensions: Vec<String>,
    recursive: bool,
    params: BTreeMap<String, String>,
}

impl DirectorySource {
    /// Every file directly under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: Vec::new(),
            recursive: false,
            params: BTreeMap::new(),
        }
    }

    /// Only files with one of these extensions (case-insensitive, leading dot optional).
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Attaches a parameter to every produced job.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a file path passes the extension filter.
    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .is_some_and(|ext| self.extensions.contains(&ext))
    }

    /// Starts the walk.
    ///
    /// Unreadable directories and entries are logged and skipped; they never
    /// end the stream early.
    pub fn into_stream(self) -> BoxStream<'static, Job> {
        let walk = Walk {
            pending: vec![self.root.clone()],
            current: None,
            source: self,
        };

        stream::unfold(walk, |mut walk| async move {
            let job = walk.next_job().await?;
            Some((job, walk))
        })
        .boxed()
    }

    fn job_for(&self, path: &Path, metadata: &Metadata) -> Job {
        let mut job = Job::new(path.display().to_string()).with_size(metadata.len());
        if let Some(marker) = modified_marker(metadata) {
            job = job.with_modified(marker);
        }
        job.params = self.params.clone();
        job
    }
}

impl From<&SourceConfig> for DirectorySource {
    fn from(config: &SourceConfig) -> Self {
        let mut source = DirectorySource::new(&config.root)
            .with_extensions(&config.extensions)
            .recursive(config.recursive);
        source.params = config.params.clone();
        source
    }
}

/// Modification time as `seconds.nanoseconds` since the epoch.
fn modified_marker(metadata: &Metadata) -> Option<String> {
    let since_epoch = metadata.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
    Some(format!(
        "{}.{:09}",
        since_epoch.as_secs(),
        since_epoch.subsec_nanos()
    ))
}

struct Walk {
    pending: Vec<PathBuf>,
    current: Option<ReadDir>,
    source: DirectorySource,
}

impl Walk {
    async fn next_job(&mut self) -> Option<Job> {
        loop {
            let Some(entries) = self.current.as_mut() else {
                let dir = self.pending.pop()?;
                match fs::read_dir(&dir).await {
                    Ok(entries) => {
                        debug!(dir = %dir.display(), "Scanning directory");
                        self.current = Some(entries);
                    }
                    Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to read directory"),
                }
                continue;
            };

            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read directory entry");
                    self.current = None;
                    continue;
                }
            };

            let path = entry.path();
            let is_dir = match entry.file_type().await {
                Ok(file_type) => file_type.is_dir(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat entry");
                    continue;
                }
            };
            if is_dir {
                if self.source.recursive {
                    self.pending.push(path);
                }
                continue;
            }

            if !self.source.matches(&path) {
                continue;
            }

            match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => {
                    return Some(self.source.job_for(&path, &metadata));
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat file");
                    continue;
                }
            }
        }
    }
}
