//! Storage configuration and path management for tasksync.
//!
//! Centralizes every path the client touches so tests can inject a temp root:
//!
//! - `config.toml`: connection and reconciliation settings
//! - `logs/`: rolling log files written by the CLI
//! - `sessions/`: session-scoped key/value files (device identity)

use std::path::{Path, PathBuf};

const ROOT_DIR: &str = ".tasksync";

/// Central configuration for all tasksync storage paths.
///
/// Production code uses `StorageConfig::default()` which points to `~/.tasksync/`.
/// Tests use `StorageConfig::with_root(temp_dir)` for isolation.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::home_dir()
            .map(|home| home.join(ROOT_DIR))
            .unwrap_or_else(|| std::env::temp_dir().join(ROOT_DIR));
        Self { root }
    }
}

impl StorageConfig {
    /// Creates a StorageConfig with a custom root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Path of the key/value file for one named session.
    ///
    /// The name is sanitized so it cannot escape `sessions/`.
    pub fn session_file(&self, session: &str) -> PathBuf {
        let safe: String = session
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.sessions_dir().join(format!("{}.json", safe))
    }
}
