//! `tasksync watch`: keep a task list in sync and print it on every change.
//!
//! ## Usage
//!
//! ```bash
//! tasksync watch --user 42 --snapshot tasks.json --endpoint tcp://localhost:8001
//! ```
//!
//! The collection is printed to stdout as one JSON array per line: once after
//! seeding, then after every applied change.

use crate::identity::resolve_device_id;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tasksync_core::{
    load_config, ConnectionState, LineTransport, SyncError, SyncSession, Task, TaskCollection,
};
use thiserror::Error;
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to read snapshot {path}: {source}")]
    SnapshotRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot {path} is not a JSON array of tasks: {source}")]
    SnapshotParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode task list: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Gave up connecting after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub user: String,
    pub endpoint: Option<String>,
    pub config: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
    pub ignore_self: bool,
    pub session: Option<String>,
    pub max_events: Option<u64>,
}

pub fn run(options: &WatchOptions) -> Result<(), WatchError> {
    let mut config = load_config(options.config.as_deref())?;
    if let Some(endpoint) = &options.endpoint {
        config.connection.endpoint = endpoint.clone();
    }
    if options.ignore_self {
        config.reconcile.ignore_self_originated = true;
    }
    let max_attempts = config.connection.max_reconnect_attempts;

    let snapshot = match &options.snapshot {
        Some(path) => load_snapshot(path)?,
        None => Vec::new(),
    };

    let device_id = resolve_device_id(options.session.as_deref());
    let mut session = SyncSession::new(config, Box::new(LineTransport::new()), device_id)?;
    session.start(&options.user, snapshot)?;
    print_tasks(&session.tasks())?;

    let mut applied = 0;
    loop {
        session.pump();

        if session.state() == ConnectionState::Failed {
            session.shutdown();
            return Err(WatchError::ConnectionFailed {
                attempts: max_attempts,
            });
        }

        let stats = session.reconcile_stats().unwrap_or_default();
        let total = stats.upserts + stats.deletes;
        if total != applied {
            applied = total;
            print_tasks(&session.tasks())?;
        }
        if options.max_events.is_some_and(|max| applied >= max) {
            info!(applied, "Reached event limit; stopping watch");
            break;
        }

        thread::sleep(POLL_INTERVAL);
    }

    session.shutdown();
    Ok(())
}

/// Reads a JSON array of task records, as returned by the task list endpoint.
pub fn load_snapshot(path: &Path) -> Result<Vec<Task>, WatchError> {
    let content = fs_err::read_to_string(path).map_err(|source| WatchError::SnapshotRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| WatchError::SnapshotParse {
        path: path.to_path_buf(),
        source,
    })
}

fn print_tasks(tasks: &TaskCollection) -> Result<(), WatchError> {
    println!("{}", serde_json::to_string(tasks.as_slice())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_loads_task_records() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("tasks.json");
        fs_err::write(
            &path,
            r#"[{"id": 1, "title": "a", "completed": false}, {"id": 2, "title": "b"}]"#,
        )
        .expect("write");

        let tasks = load_snapshot(&path).expect("snapshot");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, 1);
        assert_eq!(tasks[0].field("completed"), Some(&serde_json::json!(false)));
    }

    #[test]
    fn snapshot_rejects_non_array() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("tasks.json");
        fs_err::write(&path, r#"{"id": 1}"#).expect("write");
        assert!(matches!(
            load_snapshot(&path),
            Err(WatchError::SnapshotParse { .. })
        ));
    }

    #[test]
    fn missing_snapshot_is_read_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        assert!(matches!(
            load_snapshot(&temp_dir.path().join("nope.json")),
            Err(WatchError::SnapshotRead { .. })
        ));
    }
}
