//! Core types shared by the dispatcher, the reconciliation engine and the
//! task collection.
//!
//! The engine never interprets task fields beyond `id`; everything else is
//! carried through untouched for the presentation layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tasksync_protocol::{ErrorInfo, TaskUpdate, UpdateEventType};

pub use tasksync_protocol::TaskId;

// ═══════════════════════════════════════════════════════════════════════════════
// Task
// ═══════════════════════════════════════════════════════════════════════════════

/// A task record as held in the local collection.
///
/// Serializes flat, so `{"id": 5, "title": "Buy milk"}` round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            fields: Map::new(),
        }
    }

    /// Builds a task from a wire record, forcing `id` to `task_id`.
    pub fn from_record(task_id: TaskId, record: &Map<String, Value>) -> Self {
        let mut fields = record.clone();
        fields.remove("id");
        Self {
            id: task_id,
            fields,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Change Events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl From<UpdateEventType> for ChangeKind {
    fn from(event_type: UpdateEventType) -> Self {
        match event_type {
            UpdateEventType::TaskCreated => ChangeKind::Created,
            // A completion is a field change on an existing task.
            UpdateEventType::TaskUpdated | UpdateEventType::TaskCompleted => ChangeKind::Updated,
            UpdateEventType::TaskDeleted => ChangeKind::Deleted,
        }
    }
}

/// A decoded server-pushed change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub task_id: TaskId,
    /// Present for created/updated, absent for deleted.
    pub payload: Option<Task>,
    pub source_device_id: Option<String>,
    pub version: Option<u64>,
}

impl ChangeEvent {
    pub fn created(task: Task) -> Self {
        Self {
            kind: ChangeKind::Created,
            task_id: task.id,
            payload: Some(task),
            source_device_id: None,
            version: None,
        }
    }

    pub fn updated(task: Task) -> Self {
        Self {
            kind: ChangeKind::Updated,
            ..Self::created(task)
        }
    }

    pub fn deleted(task_id: TaskId) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            task_id,
            payload: None,
            source_device_id: None,
            version: None,
        }
    }

    pub fn from_device(mut self, device_id: &str) -> Self {
        self.source_device_id = Some(device_id.to_string());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

impl TryFrom<TaskUpdate> for ChangeEvent {
    type Error = ErrorInfo;

    fn try_from(update: TaskUpdate) -> Result<Self, Self::Error> {
        update.validate()?;

        let kind = ChangeKind::from(update.event_type);
        let payload = match kind {
            ChangeKind::Deleted => None,
            ChangeKind::Created | ChangeKind::Updated => {
                // Full task_data wins as the base; changes are layered on top.
                let mut record = update.task_data.unwrap_or_default();
                if let Some(changes) = update.changes {
                    record.extend(changes);
                }
                Some(Task::from_record(update.task_id, &record))
            }
        };

        Ok(Self {
            kind,
            task_id: update.task_id,
            payload,
            source_device_id: update.source_device_id,
            version: update.version,
        })
    }
}
