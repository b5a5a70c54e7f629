//! Device identity for the current session.
//!
//! The id tags this client's origin on the wire (handshake `device_id`, and the
//! `source_device_id` echoed back on change events). It is generated once per
//! session and reused until the session ends. It is not globally unique;
//! timestamp plus a random suffix is enough.

use crate::error::{Result, SyncError};
use crate::storage::StorageConfig;
use chrono::Utc;
use rand::Rng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// Key under which the id is kept in session storage.
pub const DEVICE_ID_KEY: &str = "device_id";

/// Returned when there is no session context to hold an id.
pub const SERVER_DEVICE_ID: &str = "server";

const SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A session-scoped key/value store.
pub trait SessionStorage {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Session storage that lives as long as the value itself.
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    values: RefCell<HashMap<String, String>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Session storage backed by a JSON file named after the session.
///
/// Lets separate CLI invocations inside one shell session share a device id.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_session(storage: &StorageConfig, session: &str) -> Self {
        Self::new(storage.session_file(session))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load(&self) -> HashMap<String, String> {
        fs_err::read(&self.path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default()
    }
}

impl SessionStorage for FileSessionStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.load().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.load();
        values.insert(key.to_string(), value.to_string());

        let io_error = |context: &str, source: std::io::Error| SyncError::Io {
            context: format!("{} {}", context, self.path.display()),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| io_error("Failed to create session dir for", err))?;
        }
        let payload = serde_json::to_vec_pretty(&values).map_err(|source| SyncError::Json {
            context: "Failed to serialize session".to_string(),
            source,
        })?;
        let tmp_path = self.path.with_extension("tmp");
        fs_err::write(&tmp_path, payload).map_err(|err| io_error("Failed to write session", err))?;
        fs_err::rename(&tmp_path, &self.path)
            .map_err(|err| io_error("Failed to commit session", err))?;
        Ok(())
    }
}

/// Returns this session's device id, generating and storing it on first use.
///
/// Without a session context the fixed [`SERVER_DEVICE_ID`] sentinel is
/// returned. A storage write failure is logged; the fresh id is still returned.
pub fn get_device_id(storage: Option<&dyn SessionStorage>) -> String {
    let Some(storage) = storage else {
        return SERVER_DEVICE_ID.to_string();
    };

    if let Some(existing) = storage.get(DEVICE_ID_KEY).filter(|id| !id.trim().is_empty()) {
        return existing;
    }

    let device_id = generate_device_id();
    if let Err(err) = storage.set(DEVICE_ID_KEY, &device_id) {
        warn!(error = %err, "Failed to persist device id for session");
    }
    device_id
}

fn generate_device_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("device-{}-{}", Utc::now().timestamp_millis(), suffix)
}
