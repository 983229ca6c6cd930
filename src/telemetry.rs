use std::cmp::Reverse;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing::subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::LogSettings;

const LOG_SUFFIX: &str = ".log.jsonl";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_LOG_FILE: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Install the console subscriber, plus a JSON-L file mirror when enabled.
pub fn init_tracing(service: &str, verbose: bool, logging: &LogSettings) -> Result<()> {
    let default_level = if verbose {
        "sweperf_bench=debug"
    } else {
        "sweperf_bench=info"
    };
    let make_env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match build_json_file_layer(service, logging)? {
        Some((writer, guard, path)) => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_writer(writer)
                        .with_filter(LevelFilter::DEBUG),
                );
            let _ = LOG_GUARD.set(guard);
            let _ = ACTIVE_LOG_FILE.set(path);
            install_subscriber(subscriber)?;
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr));
            install_subscriber(subscriber)?;
        }
    }

    Ok(())
}

/// JSON log file written by this process, if any.
pub fn current_log_file() -> Option<&'static PathBuf> {
    ACTIVE_LOG_FILE.get()
}

fn build_json_file_layer(
    service: &str,
    logging: &LogSettings,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !logging.json_file {
        return Ok(None);
    }

    let directory = logging.resolve_directory()?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let (file, path) = create_log_file(service, &directory)?;
    prune_old_logs(&directory, logging.max_files, &path)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some((writer, guard, path)))
}

fn create_log_file(service: &str, directory: &Path) -> Result<(fs::File, PathBuf)> {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut candidate = directory.join(format!("{service}-{timestamp}{LOG_SUFFIX}"));
    let mut counter = 0;
    while candidate.exists() {
        counter += 1;
        candidate = directory.join(format!("{service}-{timestamp}-{counter}{LOG_SUFFIX}"));
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&candidate)
        .with_context(|| format!("Failed to open log file {}", candidate.display()))?;
    Ok((file, candidate))
}

/// Keep at most `max_files` logs, counting `keep`. Zero disables pruning.
fn prune_old_logs(directory: &Path, max_files: usize, keep: &Path) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }

    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(directory)
        .with_context(|| format!("Failed to read log directory {}", directory.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path == keep || !path.is_file() {
            continue;
        }
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(LOG_SUFFIX));
        if !is_log {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        entries.push((modified, path));
    }

    entries.sort_by_key(|(modified, _)| Reverse(*modified));
    let retain = max_files.saturating_sub(1);
    for (_, path) in entries.into_iter().skip(retain) {
        let _ = fs::remove_file(&path);
    }
    Ok(())
}
