//! Logging setup for the `tasksync` binary.
//!
//! Human-readable logs go to stderr (stdout carries command output). A copy is
//! written to a daily rolling file under `~/.tasksync/logs` when that
//! directory can be created.
//!
//! `RUST_LOG` selects the filter; `TASKSYNC_DEBUG_LOG=1` forces `debug`.

use std::env;
use tasksync_core::StorageConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEBUG_LOG_ENV: &str = "TASKSYNC_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "tasksync.log";

/// Installs the global subscriber. The returned guard flushes the file writer
/// on drop, so `main` must hold it for the life of the process.
pub fn init() -> Option<WorkerGuard> {
    let filter = if debug_enabled(env::var(DEBUG_LOG_ENV).ok().as_deref()) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let logs_dir = StorageConfig::default().logs_dir();
    let (file_layer, guard) = match fs_err::create_dir_all(&logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn debug_enabled(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}
