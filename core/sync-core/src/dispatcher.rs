//! Event Dispatcher - typed pub/sub over the connection's inbound stream.
//!
//! Decouples "a frame arrived" from "who cares about it". Every dispatch runs
//! against a snapshot of the handler list taken when the dispatch starts, and
//! the registry is never borrowed while a handler runs, so handlers may
//! subscribe or unsubscribe (themselves included) without affecting the pass
//! in progress.
//!
//! Failures stay at this boundary: a handler returning `Err` or panicking is
//! logged, and the remaining handlers still run. Undecodable frames, and
//! `task_update` frames whose payload does not decode, are logged and dropped
//! before any handler sees them.

use crate::connection::ConnectionEvent;
use crate::error::HandlerError;
use serde_json::{json, Value};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use tasksync_protocol::{decode_frame, events, parse_task_update};
use tracing::{debug, error, warn};

/// A subscriber callback. Identity is the `Rc` allocation.
pub type Handler = Rc<dyn Fn(&Value) -> Result<(), HandlerError>>;

/// Wraps a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value) -> Result<(), HandlerError> + 'static,
{
    Rc::new(f)
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: RefCell<HashMap<String, Vec<Handler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event`. Returns false if it was already registered.
    pub fn subscribe(&self, event: &str, handler: Handler) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let registered = handlers.entry(event.to_string()).or_default();
        if registered.iter().any(|existing| same_handler(existing, &handler)) {
            debug!(event, "Handler already subscribed");
            return false;
        }
        registered.push(handler);
        true
    }

    /// Removes `handler` from `event`. Returns false if it was not registered.
    pub fn unsubscribe(&self, event: &str, handler: &Handler) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let Some(registered) = handlers.get_mut(event) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|existing| !same_handler(existing, handler));
        let removed = registered.len() != before;
        if registered.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .borrow()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Invokes every handler registered for `event`, in registration order.
    pub fn emit(&self, event: &str, payload: &Value) -> DispatchReport {
        let snapshot: Vec<Handler> = self
            .handlers
            .borrow()
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for (index, handler) in snapshot.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    error!(event, handler = index, error = %err, "Event handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    error!(
                        event,
                        handler = index,
                        panic = %panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }
        report
    }

    /// Decodes a raw frame and dispatches it. Returns `None` if the frame was dropped.
    pub fn dispatch_frame(&self, bytes: &[u8]) -> Option<DispatchReport> {
        match decode_frame(bytes) {
            Ok(frame) => {
                let payload = frame.payload();
                if frame.event == events::TASK_UPDATE {
                    if let Err(err) = parse_task_update(payload.clone()) {
                        warn!(
                            event = %frame.event,
                            code = %err.code,
                            message = %err.message,
                            "Dropping undecodable task_update payload"
                        );
                        return None;
                    }
                }
                debug!(event = %frame.event, "Dispatching inbound frame");
                Some(self.emit(&frame.event, &payload))
            }
            Err(err) => {
                warn!(
                    code = %err.code,
                    message = %err.message,
                    bytes = bytes.len(),
                    "Dropping undecodable frame"
                );
                None
            }
        }
    }

    /// Routes a connection manager event: frames are decoded, lifecycle
    /// events are dispatched under their conventional names.
    pub fn handle_connection_event(&self, event: &ConnectionEvent) -> Option<DispatchReport> {
        let report = match event {
            ConnectionEvent::Frame(bytes) => return self.dispatch_frame(bytes),
            ConnectionEvent::Connected => self.emit(events::CONNECT, &Value::Null),
            ConnectionEvent::Disconnected { reason } => {
                self.emit(events::DISCONNECT, &Value::String(reason.clone()))
            }
            ConnectionEvent::ConnectError { error, attempt } => self.emit(
                events::CONNECT_ERROR,
                &json!({ "message": error, "attempt": attempt }),
            ),
            ConnectionEvent::Failed { attempts } => {
                self.emit(events::RECONNECT_FAILED, &json!({ "attempts": attempts }))
            }
        };
        Some(report)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
