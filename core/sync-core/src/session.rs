//! SyncSession - wires the four components together for one signed-in user.
//!
//! Owns the connection manager, the dispatcher and the task collection, and
//! keeps a reconciliation engine attached between `start` and `shutdown`.
//! Like the rest of the crate it is synchronous: the caller's loop drives it
//! with [`SyncSession::pump`].
//!
//! ```rust,ignore
//! use tasksync_core::{load_config, LineTransport, SyncSession};
//!
//! let config = load_config(None)?;
//! let mut session = SyncSession::new(config, Box::new(LineTransport::new()), device_id)?;
//! session.start("user-1", initial_tasks)?;
//! loop {
//!     session.pump();
//!     render(session.tasks().as_slice());
//! }
//! ```

use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::dispatcher::{handler, EventDispatcher, Handler};
use crate::error::Result;
use crate::reconcile::{ReconcileStats, ReconciliationEngine, TaskCollection};
use crate::transport::Transport;
use crate::types::Task;
use serde_json::Value;
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::time::Instant;
use tasksync_protocol::{events, parse_disconnect_reason};
use tracing::{debug, error, info, warn};

pub struct SyncSession {
    config: SyncConfig,
    device_id: String,
    manager: ConnectionManager,
    dispatcher: Rc<EventDispatcher>,
    tasks: Rc<RefCell<TaskCollection>>,
    engine: Option<ReconciliationEngine<TaskCollection>>,
    log_handlers: Vec<(&'static str, Handler)>,
}

impl SyncSession {
    pub fn new(
        config: SyncConfig,
        transport: Box<dyn Transport>,
        device_id: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = ConnectionManager::new(transport, config.reconnect_policy());
        let dispatcher = Rc::new(EventDispatcher::new());
        let log_handlers = logging_handlers();
        for (event, handler) in &log_handlers {
            dispatcher.subscribe(event, Rc::clone(handler));
        }

        Ok(Self {
            config,
            device_id: device_id.into(),
            manager,
            dispatcher,
            tasks: Rc::new(RefCell::new(TaskCollection::new())),
            engine: None,
            log_handlers,
        })
    }

    /// Seeds the collection, attaches reconciliation and starts connecting.
    ///
    /// Calling it again (after the connection reached `Failed`, or to switch
    /// user) re-seeds the collection, resets version tracking and replaces
    /// the connection if its target changed.
    pub fn start(&mut self, user_id: &str, snapshot: Vec<Task>) -> Result<()> {
        if let Some(mut engine) = self.engine.take() {
            engine.detach();
        }
        *self.tasks.borrow_mut() = TaskCollection::from_snapshot(snapshot);
        self.engine = Some(ReconciliationEngine::attach(
            Rc::clone(&self.dispatcher),
            &self.tasks,
            self.config.reconcile_policy(),
            self.device_id.clone(),
        ));

        info!(
            user_id,
            device_id = %self.device_id,
            tasks = self.tasks.borrow().len(),
            "Starting sync session"
        );
        self.manager
            .connect(&self.config.connection.endpoint, user_id, &self.device_id)
    }

    /// Drives the connection and dispatches everything it produced.
    /// Returns the number of connection events handled.
    pub fn pump(&mut self) -> usize {
        self.pump_at(Instant::now())
    }

    pub fn pump_at(&mut self, now: Instant) -> usize {
        let events = self.manager.poll_at(now);
        self.dispatch(&events);
        events.len()
    }

    pub fn ping(&mut self) -> bool {
        self.manager.ping()
    }

    /// Detaches reconciliation and closes the connection.
    ///
    /// The trailing `disconnect` notification is still dispatched to any
    /// remaining listeners; the task collection no longer changes.
    pub fn shutdown(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.detach();
        }
        self.manager.disconnect();
        let events = self.manager.poll();
        self.dispatch(&events);
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.manager.next_retry_at()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tasks(&self) -> Ref<'_, TaskCollection> {
        self.tasks.borrow()
    }

    pub fn dispatcher(&self) -> &Rc<EventDispatcher> {
        &self.dispatcher
    }

    /// `None` until `start` has been called or after `shutdown`.
    pub fn reconcile_stats(&self) -> Option<ReconcileStats> {
        self.engine.as_ref().map(ReconciliationEngine::stats)
    }

    fn dispatch(&self, events: &[ConnectionEvent]) {
        for event in events {
            self.dispatcher.handle_connection_event(event);
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        for (event, handler) in &self.log_handlers {
            self.dispatcher.unsubscribe(event, handler);
        }
    }
}

fn logging_handlers() -> Vec<(&'static str, Handler)> {
    vec![
        (
            events::CONNECTED,
            handler(|payload: &Value| {
                let device_id = payload
                    .get("device_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
                info!(device_id, message, "Sync broker acknowledged connection");
                Ok(())
            }),
        ),
        (
            events::PONG,
            handler(|_| {
                debug!("Received pong");
                Ok(())
            }),
        ),
        (
            events::ERROR,
            handler(|payload: &Value| {
                warn!(payload = %payload, "Sync broker reported an error");
                Ok(())
            }),
        ),
        (
            events::DISCONNECT,
            handler(|payload: &Value| {
                info!(reason = %parse_disconnect_reason(payload), "Sync connection closed");
                Ok(())
            }),
        ),
        (
            events::RECONNECT_FAILED,
            handler(|payload: &Value| {
                error!(payload = %payload, "Sync connection gave up reconnecting");
                Ok(())
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = SyncConfig::default();
        config.connection.max_reconnect_attempts = 0;
        let (transport, _remote) = MemoryTransport::pair();
        assert!(SyncSession::new(config, Box::new(transport), "device-a").is_err());
    }

    #[test]
    fn start_connects_with_device_id() {
        let (transport, remote) = MemoryTransport::pair();
        let mut session =
            SyncSession::new(SyncConfig::default(), Box::new(transport), "device-a").unwrap();
        session.start("user-1", vec![Task::new(1)]).unwrap();
        remote.accept();
        session.pump();

        assert!(session.is_connected());
        let handshake = remote.last_handshake().unwrap();
        assert_eq!(handshake.user_id, "user-1");
        assert_eq!(handshake.device_id, "device-a");
        assert_eq!(session.tasks().ids(), vec![1]);
    }

    #[test]
    fn shutdown_detaches_reconciliation() {
        let (transport, remote) = MemoryTransport::pair();
        let mut session =
            SyncSession::new(SyncConfig::default(), Box::new(transport), "device-a").unwrap();
        session.start("user-1", Vec::new()).unwrap();
        remote.accept();
        session.pump();
        assert!(session.is_connected());

        let disconnects = Rc::new(Cell::new(0));
        {
            let disconnects = Rc::clone(&disconnects);
            session.dispatcher().subscribe(
                "disconnect",
                handler(move |_| {
                    disconnects.set(disconnects.get() + 1);
                    Ok(())
                }),
            );
        }

        session.shutdown();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(disconnects.get(), 1);
        assert!(session.reconcile_stats().is_none());
        assert_eq!(session.dispatcher().handler_count("task_update"), 0);

        remote.push_event(
            "task_update",
            json!({"event_type": "task.created", "task_id": 1, "task_data": {"id": 1}}),
        );
        session.pump();
        assert!(session.tasks().is_empty());
    }

    #[test]
    fn switching_user_replaces_the_stream() {
        let (transport, remote) = MemoryTransport::pair();
        let mut session =
            SyncSession::new(SyncConfig::default(), Box::new(transport), "device-a").unwrap();
        session.start("user-1", vec![Task::new(1)]).unwrap();
        remote.accept();
        session.pump();

        session.start("user-2", vec![Task::new(99)]).unwrap();
        assert_eq!(remote.open_calls(), 2);
        assert_eq!(remote.last_handshake().unwrap().user_id, "user-2");
        assert_eq!(session.dispatcher().handler_count("task_update"), 1);

        // Arrives before the new connection opens, so it is dropped.
        remote.push_event(
            "task_update",
            json!({"event_type": "task.created", "task_id": 5, "task_data": {"id": 5}}),
        );
        remote.accept();
        session.pump();
        assert!(session.is_connected());
        assert_eq!(session.tasks().ids(), vec![99]);

        remote.push_event(
            "task_update",
            json!({"event_type": "task.created", "task_id": 7, "task_data": {"id": 7}}),
        );
        session.pump();
        assert_eq!(session.tasks().ids(), vec![7, 99]);
    }

    #[test]
    fn drop_releases_logging_handlers() {
        let (transport, _remote) = MemoryTransport::pair();
        let session =
            SyncSession::new(SyncConfig::default(), Box::new(transport), "device-a").unwrap();
        let dispatcher = Rc::clone(session.dispatcher());
        assert_eq!(dispatcher.handler_count("pong"), 1);
        drop(session);
        assert_eq!(dispatcher.handler_count("pong"), 0);
    }
}
