//! Tracing subscriber setup for the node binary.

use crate::config::ProcessConfig;
use std::path::Path;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// level. When a log file is configured, output goes to a daily rolling
/// file through a non-blocking writer; the returned guard must live as long
/// as the process or buffered lines are lost.
pub fn init(process: &ProcessConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if process.log_level.trim().is_empty() {
        "info"
    } else {
        process.log_level.trim()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt().with_env_filter(filter).with_target(true);

    match &process.log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            builder
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            builder
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
            Ok(None)
        }
    }
}

fn file_writer(path: &Path) -> anyhow::Result<(non_blocking::NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "node.log".to_string());
    let appender = rolling::daily(dir, file_name);
    Ok(non_blocking(appender))
}
