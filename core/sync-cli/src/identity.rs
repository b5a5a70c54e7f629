//! Device id resolution for CLI invocations.
//!
//! With a session name (`--session` or `TASKSYNC_SESSION`) the id lives in a
//! session file, so every command run inside that shell session reports the
//! same device. Without one, each invocation is its own session.

use std::env;
use tasksync_core::{get_device_id, FileSessionStorage, MemorySessionStorage, StorageConfig};

pub const SESSION_ENV: &str = "TASKSYNC_SESSION";

pub fn resolve_device_id(session: Option<&str>) -> String {
    resolve_with_storage(&StorageConfig::default(), session)
}

fn resolve_with_storage(storage: &StorageConfig, session: Option<&str>) -> String {
    let session = session
        .map(str::to_string)
        .or_else(|| env::var(SESSION_ENV).ok())
        .filter(|name| !name.trim().is_empty());

    match session {
        Some(name) => get_device_id(Some(&FileSessionStorage::for_session(storage, &name))),
        None => get_device_id(Some(&MemorySessionStorage::new())),
    }
}
