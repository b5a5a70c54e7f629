//! Configuration loading for the sync engine.
//!
//! Settings come from `~/.tasksync/config.toml` (or an explicit path). A
//! missing file yields defaults; `TASKSYNC_ENDPOINT` overrides the endpoint.

use crate::connection::{Backoff, ReconnectPolicy};
use crate::error::{Result, SyncError};
use crate::reconcile::ReconcilePolicy;
use crate::storage::StorageConfig;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tasksync_protocol::DEFAULT_ENDPOINT;

pub const ENDPOINT_ENV: &str = "TASKSYNC_ENDPOINT";

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_RECONNECT_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub backoff: BackoffKind,
    pub max_reconnect_delay_ms: u64,
    pub auto_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            backoff: BackoffKind::Fixed,
            max_reconnect_delay_ms: DEFAULT_MAX_RECONNECT_DELAY_MS,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub ignore_self_originated: bool,
    pub enforce_versions: bool,
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_reconnect_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "connection.max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.connection.endpoint.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "connection.endpoint is required".to_string(),
            ));
        }
        Endpoint::parse(&self.connection.endpoint)?;
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let delay = Duration::from_millis(self.connection.reconnect_delay_ms);
        let backoff = match self.connection.backoff {
            BackoffKind::Fixed => Backoff::Fixed { delay },
            BackoffKind::Exponential => Backoff::Exponential {
                initial: delay,
                max: Duration::from_millis(
                    self.connection
                        .max_reconnect_delay_ms
                        .max(self.connection.reconnect_delay_ms),
                ),
            },
        };
        ReconnectPolicy {
            max_attempts: self.connection.max_reconnect_attempts,
            backoff,
            auto_reconnect: self.connection.auto_reconnect,
        }
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            ignore_self_originated: self.reconcile.ignore_self_originated,
            enforce_versions: self.reconcile.enforce_versions,
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| SyncError::InvalidConfig(format!("Failed to serialize config: {}", err)))
    }
}

/// Loads configuration from `path`, or from the default location when `None`.
///
/// A missing file is not an error. The endpoint env override is applied last.
pub fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let default_path = StorageConfig::default().config_file();
    let config_path = path.unwrap_or(&default_path);

    let mut config = if config_path.exists() {
        let content = fs_err::read_to_string(config_path).map_err(|err| SyncError::Io {
            context: format!("Failed to read config {}", config_path.display()),
            source: err,
        })?;
        toml::from_str::<SyncConfig>(&content).map_err(|err| SyncError::ConfigMalformed {
            path: config_path.to_path_buf(),
            details: err.to_string(),
        })?
    } else {
        SyncConfig::default()
    };

    if let Ok(endpoint) = env::var(ENDPOINT_ENV) {
        if !endpoint.trim().is_empty() {
            config.connection.endpoint = endpoint;
        }
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.connection.endpoint, "tcp://localhost:8001");
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.connection.reconnect_delay_ms, 1000);
        assert!(config.connection.auto_reconnect);
        assert!(!config.reconcile.ignore_self_originated);
        assert!(!config.reconcile.enforce_versions);
    }

    #[test]
    fn load_config_defaults_when_file_missing() {
        let _guard = env_lock();
        std::env::remove_var(ENDPOINT_ENV);
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let config = load_config(Some(&path)).expect("load config");
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let _guard = env_lock();
        std::env::remove_var(ENDPOINT_ENV);
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[connection]
endpoint = "tcp://sync.example.com:9000"
max_reconnect_attempts = 3
reconnect_delay_ms = 250
backoff = "exponential"

[reconcile]
ignore_self_originated = true
"#,
        )
        .expect("write config");

        let config = load_config(Some(&path)).expect("load config");
        assert_eq!(config.connection.endpoint, "tcp://sync.example.com:9000");
        assert_eq!(config.connection.max_reconnect_attempts, 3);
        assert_eq!(config.connection.backoff, BackoffKind::Exponential);
        assert_eq!(config.connection.max_reconnect_delay_ms, 30_000);
        assert!(config.reconcile.ignore_self_originated);
        assert!(!config.reconcile.enforce_versions);

        let policy = config.reconnect_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                initial: Duration::from_millis(250),
                max: Duration::from_millis(30_000),
            }
        );
    }

    #[test]
    fn load_config_rejects_zero_attempts() {
        let _guard = env_lock();
        std::env::remove_var(ENDPOINT_ENV);
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[connection]\nmax_reconnect_attempts = 0\n").expect("write");
        assert!(matches!(
            load_config(Some(&path)),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn load_config_rejects_non_tcp_endpoint() {
        let _guard = env_lock();
        std::env::remove_var(ENDPOINT_ENV);
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[connection]\nendpoint = \"http://localhost:8001\"\n")
            .expect("write");
        assert!(matches!(
            load_config(Some(&path)),
            Err(SyncError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn load_config_reports_malformed_file() {
        let _guard = env_lock();
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[connection\nendpoint = ").expect("write");
        assert!(matches!(
            load_config(Some(&path)),
            Err(SyncError::ConfigMalformed { .. })
        ));
    }

    #[test]
    fn endpoint_env_overrides_file() {
        let _guard = env_lock();
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        std::env::set_var(ENDPOINT_ENV, "tcp://override:7000");
        let config = load_config(Some(&path));
        std::env::remove_var(ENDPOINT_ENV);
        assert_eq!(
            config.expect("load config").connection.endpoint,
            "tcp://override:7000"
        );
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = SyncConfig::default();
        let text = config.to_toml().expect("toml");
        let parsed: SyncConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }
}
