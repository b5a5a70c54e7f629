//! # tasksync-core
//!
//! Client-side engine for real-time task synchronization: keeps a local task
//! collection in step with server-pushed change events over a persistent
//! connection.
//!
//! ## Components
//!
//! - **Device identity** ([`device`]): a per-session id sent in the handshake.
//! - **Connection manager** ([`connection`]): one transport, bounded reconnects.
//! - **Event dispatcher** ([`dispatcher`]): named pub/sub over inbound frames.
//! - **Reconciliation** ([`reconcile`]): applies change events to the collection.
//!
//! [`SyncSession`] wires them together.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The caller's loop drives
//!   everything through `poll`/`pump`.
//! - **Single-threaded**: Shared state is `Rc<RefCell<_>>`; nothing here is `Send`.
//! - **Graceful degradation**: Bad frames and failing handlers are logged and
//!   dropped, never propagated into the connection.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tasksync_core::{get_device_id, load_config, LineTransport, MemorySessionStorage, SyncSession};
//!
//! let session_storage = MemorySessionStorage::new();
//! let device_id = get_device_id(Some(&session_storage));
//! let mut session = SyncSession::new(load_config(None)?, Box::new(LineTransport::new()), device_id)?;
//! session.start("user-1", Vec::new())?;
//! session.pump();
//! ```

pub mod config;
pub mod connection;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod reconcile;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::{load_config, BackoffKind, ConnectionConfig, ReconcileConfig, SyncConfig};
pub use connection::{
    Backoff, ConnectionEvent, ConnectionManager, ConnectionState, ReconnectPolicy,
};
pub use device::{
    get_device_id, FileSessionStorage, MemorySessionStorage, SessionStorage, DEVICE_ID_KEY,
    SERVER_DEVICE_ID,
};
pub use dispatcher::{handler, DispatchReport, EventDispatcher, Handler};
pub use error::{HandlerError, Result, SyncError};
pub use reconcile::{
    reconcile, FnSink, ReconcileContext, ReconcilePolicy, ReconcileStats, ReconciliationEngine,
    SkipReason, TaskChange, TaskCollection, TaskSink,
};
pub use session::SyncSession;
pub use storage::StorageConfig;
pub use transport::{Endpoint, LineTransport, MemoryRemote, MemoryTransport, Transport, TransportEvent};
pub use types::{ChangeEvent, ChangeKind, Task, TaskId};

pub use tasksync_protocol as protocol;
