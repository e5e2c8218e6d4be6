mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sluice_core::metrics::encode_metrics;
use sluice_core::{
    load_config, validate_config, BatchRunner, CommandProcessor, CommandSpec, Config,
    ContentCache, CooperativeExecutor, DirectorySource, Executor, ExecutorBackend, LogFormat,
    ProcessPoolExecutor, ProgressSnapshot, ThreadPoolExecutor,
};

use progress::ProgressLogger;

/// Config file used when `SLUICE_CONFIG` is unset
const DEFAULT_CONFIG_PATH: &str = "sluice.toml";

/// Exit status when `fail_on_error` is set and a job failed
const EXIT_JOB_FAILURES: i32 = 2;

/// Exit status after Ctrl+C or SIGTERM
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    // Determine config path
    let config_path = std::env::var("SLUICE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    // Logging goes up first so config errors are reported through it
    let loaded = load_config(&config_path);
    init_logging(
        loaded
            .as_ref()
            .map(|config| config.logging.format)
            .unwrap_or_default(),
    );

    let config = loaded.with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded from {:?}", config_path);
    info!(
        backend = ?config.engine.backend,
        max_concurrency = config.engine.max_concurrency,
        cache = ?config.cache.backend,
        program = %config.processor.program,
        "Engine configured"
    );

    let root = &config.source.root;
    let metadata = tokio::fs::metadata(root)
        .await
        .with_context(|| format!("Source root {:?} is not accessible", root))?;
    if !metadata.is_dir() {
        bail!("Source root {:?} is not a directory", root);
    }

    let processor = CommandProcessor::new(CommandSpec::from(&config.processor));
    let slots = config.engine.max_concurrency;
    let summary = match config.engine.backend {
        ExecutorBackend::Cooperative => {
            execute(CooperativeExecutor::new(processor, slots), &config).await?
        }
        ExecutorBackend::ThreadPool => {
            let pool = ThreadPoolExecutor::new(processor, slots)
                .context("Failed to start worker threads")?;
            execute(pool, &config).await?
        }
        ExecutorBackend::ProcessPool => {
            execute(ProcessPoolExecutor::new(processor, slots), &config).await?
        }
    };

    if let Some(path) = &config.output.metrics_path {
        tokio::fs::write(path, encode_metrics())
            .await
            .with_context(|| format!("Failed to write metrics to {:?}", path))?;
        info!("Metrics written to {:?}", path);
    }

    let json = serde_json::to_string_pretty(&summary.snapshot)
        .context("Failed to serialize final snapshot")?;
    println!("{}", json);

    if summary.interrupted {
        return Ok(EXIT_INTERRUPTED);
    }
    if config.output.fail_on_error && summary.snapshot.failed > 0 {
        warn!(failed = summary.snapshot.failed, "Run finished with failed jobs");
        return Ok(EXIT_JOB_FAILURES);
    }
    Ok(0)
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries the final snapshot; logs go to stderr
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

struct RunSummary {
    snapshot: ProgressSnapshot,
    interrupted: bool,
}

/// Runs the configured source through `executor` until the source is
/// exhausted or a shutdown signal arrives.
async fn execute<E>(executor: E, config: &Config) -> Result<RunSummary>
where
    E: Executor,
    E::Output: Serialize + DeserializeOwned,
{
    let cache = ContentCache::from_config(&config.cache).context("Failed to open result cache")?;
    let runner = BatchRunner::from_config(executor, &config.engine, Arc::new(cache))
        .context("Invalid engine limits")?
        .with_observer(ProgressLogger::new(Duration::from_millis(
            config.engine.progress_interval_ms,
        )));

    let source = DirectorySource::from(&config.source).into_stream();
    let mut batch = runner.run(source);
    info!(run_id = %batch.run_id(), root = ?config.source.root, "Batch started");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut interrupted = false;
    loop {
        tokio::select! {
            item = batch.next() => {
                if item.is_none() {
                    break;
                }
            }
            _ = &mut shutdown => {
                warn!("Shutdown signal received, abandoning in-flight jobs");
                interrupted = true;
                break;
            }
        }
    }

    let snapshot = batch.snapshot();
    // Dropping the stream cancels whatever is still in flight.
    drop(batch);

    Ok(RunSummary {
        snapshot,
        interrupted,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
