//! Logging initialisation for workspace-control and workspace-pilot.
//!
//! When the `WORKSPACE_LOG` environment variable is set to `1`, or a log
//! directory is configured, structured logs are also written to
//! `<log_dir>/<app>.log`. Otherwise only stderr output (filtered by `RUST_LOG`)
//! is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::{Path, PathBuf};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process. `app` names the log file.
pub fn init(app: &str, log_dir: Option<&Path>) -> LogGuard {
    let file_dir: Option<PathBuf> = match log_dir {
        Some(dir) => Some(dir.to_path_buf()),
        None if std::env::var("WORKSPACE_LOG").as_deref() == Ok("1") => Some(
            crate::paths::default_log_dir().unwrap_or_else(|| PathBuf::from("/tmp")),
        ),
        None => None,
    };

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = if let Some(dir) = file_dir {
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, format!("{app}.log"));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .try_init();

        Some(guard)
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
