//! Reconciliation of server-pushed change events into the local task collection.
//!
//! [`reconcile`] is a pure decision over one event; [`ReconciliationEngine`]
//! wires it to the dispatcher's `task_update` stream and applies the outcome
//! to a [`TaskSink`].
//!
//! Rules:
//! - created/updated: replace the task with a matching id in place, or insert
//!   it at the head of the collection if absent.
//! - deleted: remove the task if present; a delete for an unknown id is a no-op.
//! - Applying the same event twice leaves the same collection.
//!
//! Echo suppression (`ignore_self_originated`) and the per-task version gate
//! (`enforce_versions`) are opt-in; with both off every event is applied.

use crate::dispatcher::{EventDispatcher, Handler};
use crate::error::HandlerError;
use crate::types::{ChangeEvent, ChangeKind, Task, TaskId};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use tasksync_protocol::{events, parse_task_update};
use tracing::{debug, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Sinks
// ═══════════════════════════════════════════════════════════════════════════════

/// The presentation-side mutation interface.
pub trait TaskSink {
    fn apply_upsert(&mut self, task: Task);
    fn apply_delete(&mut self, task_id: TaskId);
}

/// A sink made of two closures, for callers that keep their own state.
pub struct FnSink<U, D> {
    upsert: U,
    delete: D,
}

impl<U, D> FnSink<U, D>
where
    U: FnMut(Task),
    D: FnMut(TaskId),
{
    pub fn new(upsert: U, delete: D) -> Self {
        Self { upsert, delete }
    }
}

impl<U, D> TaskSink for FnSink<U, D>
where
    U: FnMut(Task),
    D: FnMut(TaskId),
{
    fn apply_upsert(&mut self, task: Task) {
        (self.upsert)(task)
    }

    fn apply_delete(&mut self, task_id: TaskId) {
        (self.delete)(task_id)
    }
}

/// Ordered task list with unique ids, newest inserts first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskCollection {
    tasks: Vec<Task>,
}

impl TaskCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the collection from an initial fetch. Later duplicates of an id are dropped.
    pub fn from_snapshot(tasks: Vec<Task>) -> Self {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(tasks.len());
        for task in tasks {
            if seen.insert(task.id) {
                unique.push(task);
            } else {
                warn!(task_id = task.id, "Dropping duplicate task from snapshot");
            }
        }
        Self { tasks: unique }
    }

    /// Replaces the task with the same id in place, or inserts at the head.
    pub fn upsert(&mut self, task: Task) {
        match self.tasks.iter_mut().find(|existing| existing.id == task.id) {
            Some(existing) => *existing = task,
            None => self.tasks.insert(0, task),
        }
    }

    /// Returns true if a task was removed.
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.id != task_id);
        self.tasks.len() != before
    }

    pub fn get(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn as_slice(&self) -> &[Task] {
        &self.tasks
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|task| task.id).collect()
    }
}

impl TaskSink for TaskCollection {
    fn apply_upsert(&mut self, task: Task) {
        self.upsert(task);
    }

    fn apply_delete(&mut self, task_id: TaskId) {
        self.remove(task_id);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Skip events whose `source_device_id` is this device.
    pub ignore_self_originated: bool,
    /// Skip events whose version is not newer than the last one applied for the task.
    pub enforce_versions: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub policy: ReconcilePolicy,
    pub local_device_id: &'a str,
    pub last_version: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SelfOriginated,
    StaleVersion { seen: u64, received: u64 },
    MissingPayload,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::SelfOriginated => write!(f, "self-originated"),
            SkipReason::StaleVersion { seen, received } => {
                write!(f, "stale version {} (seen {})", received, seen)
            }
            SkipReason::MissingPayload => write!(f, "missing payload"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskChange {
    Upsert(Task),
    Delete(TaskId),
    Skip(SkipReason),
}

pub fn reconcile(event: &ChangeEvent, ctx: &ReconcileContext<'_>) -> TaskChange {
    if ctx.policy.ignore_self_originated
        && event.source_device_id.as_deref() == Some(ctx.local_device_id)
    {
        return TaskChange::Skip(SkipReason::SelfOriginated);
    }

    // Deletes are unconditional, even under the version gate.
    if event.kind == ChangeKind::Deleted {
        return TaskChange::Delete(event.task_id);
    }

    if let Some(reason) = stale_version(event, ctx) {
        return TaskChange::Skip(reason);
    }

    match event.payload.as_ref() {
        Some(task) if task.id == event.task_id => TaskChange::Upsert(task.clone()),
        Some(task) => TaskChange::Upsert(Task {
            id: event.task_id,
            fields: task.fields.clone(),
        }),
        None => TaskChange::Skip(SkipReason::MissingPayload),
    }
}

fn stale_version(event: &ChangeEvent, ctx: &ReconcileContext<'_>) -> Option<SkipReason> {
    if !ctx.policy.enforce_versions {
        return None;
    }
    // Unversioned events are always applied.
    let (seen, received) = (ctx.last_version?, event.version?);
    (received <= seen).then_some(SkipReason::StaleVersion { seen, received })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters for what the engine did with the events it received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub upserts: u64,
    pub deletes: u64,
    pub skipped: u64,
    pub rejected: u64,
}

struct EngineState<S> {
    sink: Weak<RefCell<S>>,
    policy: ReconcilePolicy,
    local_device_id: String,
    versions: RefCell<HashMap<TaskId, u64>>,
    stats: RefCell<ReconcileStats>,
}

impl<S: TaskSink> EngineState<S> {
    fn handle_payload(&self, payload: &Value) -> Result<(), HandlerError> {
        let event = parse_task_update(payload.clone())
            .and_then(ChangeEvent::try_from)
            .map_err(|err| {
                self.stats.borrow_mut().rejected += 1;
                HandlerError::from(err)
            })?;
        self.apply(&event).map(|_| ())
    }

    fn apply(&self, event: &ChangeEvent) -> Result<TaskChange, HandlerError> {
        let last_version = self.versions.borrow().get(&event.task_id).copied();
        let change = reconcile(
            event,
            &ReconcileContext {
                policy: self.policy,
                local_device_id: &self.local_device_id,
                last_version,
            },
        );

        if let TaskChange::Skip(reason) = &change {
            self.stats.borrow_mut().skipped += 1;
            debug!(task_id = event.task_id, reason = %reason, "Skipped task change");
            return Ok(change);
        }

        let Some(sink) = self.sink.upgrade() else {
            debug!(task_id = event.task_id, "Task sink dropped; ignoring change");
            return Ok(change);
        };
        let mut sink = sink
            .try_borrow_mut()
            .map_err(|_| HandlerError::Failed("task sink is busy".to_string()))?;

        match &change {
            TaskChange::Upsert(task) => {
                sink.apply_upsert(task.clone());
                self.stats.borrow_mut().upserts += 1;
                debug!(task_id = task.id, kind = event.kind.as_str(), "Applied task upsert");
            }
            TaskChange::Delete(task_id) => {
                sink.apply_delete(*task_id);
                self.stats.borrow_mut().deletes += 1;
                debug!(task_id, "Applied task delete");
            }
            TaskChange::Skip(_) => {}
        }

        // Versions outlive deletes so a late update cannot resurrect the task.
        if let Some(version) = event.version {
            let mut versions = self.versions.borrow_mut();
            let entry = versions.entry(event.task_id).or_insert(version);
            *entry = (*entry).max(version);
        }

        Ok(change)
    }
}

/// Subscribes to `task_update` and applies every change to a sink.
///
/// The engine holds the sink weakly: once the owner drops it, later events
/// are ignored. Dropping the engine unsubscribes it.
pub struct ReconciliationEngine<S: TaskSink + 'static> {
    dispatcher: Rc<EventDispatcher>,
    state: Rc<EngineState<S>>,
    handler: Handler,
    attached: bool,
}

impl<S: TaskSink + 'static> ReconciliationEngine<S> {
    pub fn attach(
        dispatcher: Rc<EventDispatcher>,
        sink: &Rc<RefCell<S>>,
        policy: ReconcilePolicy,
        local_device_id: impl Into<String>,
    ) -> Self {
        let state = Rc::new(EngineState {
            sink: Rc::downgrade(sink),
            policy,
            local_device_id: local_device_id.into(),
            versions: RefCell::new(HashMap::new()),
            stats: RefCell::new(ReconcileStats::default()),
        });

        let handler: Handler = {
            let state = Rc::clone(&state);
            Rc::new(move |payload: &Value| state.handle_payload(payload))
        };
        dispatcher.subscribe(events::TASK_UPDATE, Rc::clone(&handler));

        Self {
            dispatcher,
            state,
            handler,
            attached: true,
        }
    }

    /// Applies a change that did not come through the dispatcher.
    pub fn apply(&self, event: &ChangeEvent) -> Result<TaskChange, HandlerError> {
        self.state.apply(event)
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.state.policy
    }

    pub fn stats(&self) -> ReconcileStats {
        *self.state.stats.borrow()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn detach(&mut self) {
        if self.attached {
            self.dispatcher
                .unsubscribe(events::TASK_UPDATE, &self.handler);
            self.attached = false;
        }
    }
}

impl<S: TaskSink + 'static> Drop for ReconciliationEngine<S> {
    fn drop(&mut self) {
        self.detach();
    }
}
