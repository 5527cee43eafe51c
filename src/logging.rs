use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides `default_level`. With a `log_dir`, diagnostics are
/// also written to a daily rolling `ksu-flasher.log` there.
pub fn init(default_level: &str, log_dir: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true);

    let result = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "ksu-flasher.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            builder
                .with_writer(std::io::stderr.and(non_blocking))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    result.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logging_creates_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        init("debug", Some(&log_dir)).unwrap();
        tracing::info!("written to the rolling file");

        assert!(log_dir.is_dir());
        assert!(LOG_GUARD.get().is_some());
    }
}
