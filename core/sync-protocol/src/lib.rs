//! Wire protocol types and validation for the tasksync real-time channel.
//!
//! This crate is shared by every client of the change broker to prevent schema
//! drift. The broker remains the authority on what it emits; clients reuse these
//! types to decode inbound frames and to build the handshake and `ping` frames.
//!
//! Every frame is a single JSON object on its own line:
//!
//! ```text
//! {"event":"task_update","data":{"event_type":"task.updated","task_id":5,"changes":{...}}}
//! ```

use chrono::DateTime;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_ENDPOINT: &str = "tcp://localhost:8001";

/// Event names carried in [`Frame::event`].
pub mod events {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const CONNECTED: &str = "connected";
    pub const TASK_UPDATE: &str = "task_update";
    pub const PONG: &str = "pong";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const ERROR: &str = "error";
    pub const PING: &str = "ping";
    pub const HANDSHAKE: &str = "handshake";
    /// Emitted locally when the reconnect budget is exhausted.
    pub const RECONNECT_FAILED: &str = "reconnect_failed";
}

pub type TaskId = i64;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

// ─────────────────────────────────────────────────────────────────────────────
// Framing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn new(event: &str, data: Option<Value>) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    pub fn ping() -> Self {
        Self::new(events::PING, None)
    }

    pub fn handshake(handshake: &Handshake) -> Result<Self, ErrorInfo> {
        let data = serde_json::to_value(handshake).map_err(|err| {
            ErrorInfo::new(
                "invalid_handshake",
                format!("handshake is not serializable: {}", err),
            )
        })?;
        Ok(Self::new(events::HANDSHAKE, Some(data)))
    }

    /// Serializes the frame as one newline-terminated JSON line.
    pub fn encode(&self) -> Result<Vec<u8>, ErrorInfo> {
        let mut payload = serde_json::to_vec(self).map_err(|err| {
            ErrorInfo::new("encode_failed", format!("frame is not serializable: {}", err))
        })?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(ErrorInfo::new(
                "frame_too_large",
                format!("frame exceeds {} bytes", MAX_FRAME_BYTES),
            ));
        }
        payload.push(b'\n');
        Ok(payload)
    }

    /// The payload, or `null` when the frame carries none.
    pub fn payload(&self) -> Value {
        self.data.clone().unwrap_or(Value::Null)
    }
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ErrorInfo> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ErrorInfo::new(
            "frame_too_large",
            format!("frame exceeds {} bytes", MAX_FRAME_BYTES),
        ));
    }

    let trimmed = trim_ascii_whitespace(bytes);
    if trimmed.is_empty() {
        return Err(ErrorInfo::new("empty_frame", "frame was empty"));
    }

    let frame: Frame = serde_json::from_slice(trimmed).map_err(|err| {
        ErrorInfo::new("invalid_frame", format!("frame is not valid JSON: {}", err))
    })?;

    if frame.event.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "event is required"));
    }

    Ok(frame)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|index| index + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub user_id: String,
    pub device_id: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl Handshake {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_non_blank(&self.user_id, "user_id")?;
        require_non_blank(&self.device_id, "device_id")?;
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ErrorInfo::new(
                "unsupported_protocol_version",
                format!(
                    "protocol_version {} is not supported (expected {})",
                    self.protocol_version, PROTOCOL_VERSION
                ),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// task_update payload
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpdateEventType {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.updated")]
    TaskUpdated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.deleted")]
    TaskDeleted,
}

impl UpdateEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateEventType::TaskCreated => "task.created",
            UpdateEventType::TaskUpdated => "task.updated",
            UpdateEventType::TaskCompleted => "task.completed",
            UpdateEventType::TaskDeleted => "task.deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "task.created" => Some(UpdateEventType::TaskCreated),
            "task.updated" => Some(UpdateEventType::TaskUpdated),
            "task.completed" => Some(UpdateEventType::TaskCompleted),
            "task.deleted" => Some(UpdateEventType::TaskDeleted),
            _ => None,
        }
    }

    pub fn carries_payload(&self) -> bool {
        !matches!(self, UpdateEventType::TaskDeleted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub event_type: UpdateEventType,
    #[serde(deserialize_with = "deserialize_task_id")]
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TaskUpdate {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_type.carries_payload() && self.changes.is_none() && self.task_data.is_none()
        {
            return Err(ErrorInfo::new(
                "missing_field",
                format!("{} requires changes or task_data", self.event_type.as_str()),
            ));
        }

        for record in [self.task_data.as_ref(), self.changes.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(id) = record.get("id") {
                if id_value(id) != Some(self.task_id) {
                    return Err(ErrorInfo::new(
                        "task_id_mismatch",
                        format!("payload id {} does not match task_id {}", id, self.task_id),
                    ));
                }
            }
        }

        if let Some(timestamp) = self.timestamp.as_deref() {
            if DateTime::parse_from_rfc3339(timestamp).is_err() {
                return Err(ErrorInfo::new(
                    "invalid_timestamp",
                    "timestamp must be RFC3339",
                ));
            }
        }

        Ok(())
    }
}

/// Parses a `task_update` payload.
///
/// Accepts the flat payload as well as the broker envelope
/// `{"type": "task.updated", "data": {...}}`.
pub fn parse_task_update(payload: Value) -> Result<TaskUpdate, ErrorInfo> {
    let payload = unwrap_envelope(payload);

    let event_type = payload
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorInfo::new("missing_field", "event_type is required"))?;
    if UpdateEventType::parse(event_type).is_none() {
        return Err(ErrorInfo::new(
            "unsupported_event_type",
            format!("event_type {} is not supported", event_type),
        ));
    }

    let update: TaskUpdate = serde_json::from_value(payload).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("task_update payload is invalid: {}", err),
        )
    })?;
    update.validate()?;
    Ok(update)
}

fn unwrap_envelope(payload: Value) -> Value {
    match payload {
        Value::Object(mut object)
            if !object.contains_key("event_type")
                && object.get("data").map(Value::is_object).unwrap_or(false) =>
        {
            object.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Extracts a human-readable reason from a `disconnect` payload.
pub fn parse_disconnect_reason(payload: &Value) -> String {
    match payload {
        Value::String(reason) => reason.clone(),
        Value::Object(object) => object
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        _ => "unknown".to_string(),
    }
}

fn deserialize_task_id<'de, D>(deserializer: D) -> Result<TaskId, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_value(&value).ok_or_else(|| de::Error::custom("task_id must be an integer"))
}

/// Reads an integer id from a JSON number or a numeric string.
pub fn id_value(value: &Value) -> Option<TaskId> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<TaskId>().ok(),
        _ => None,
    }
}

fn require_non_blank(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_frame_with_trailing_newline() {
        let frame = decode_frame(b"{\"event\":\"pong\"}\n").expect("frame");
        assert_eq!(frame.event, "pong");
        assert_eq!(frame.payload(), Value::Null);
    }

    #[test]
    fn rejects_empty_frame() {
        let err = decode_frame(b"  \n").unwrap_err();
        assert_eq!(err.code, "empty_frame");
    }

    #[test]
    fn rejects_frame_without_event() {
        let err = decode_frame(br#"{"event":"  ","data":{}}"#).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_invalid_json_frame() {
        let err = decode_frame(b"{not json").unwrap_err();
        assert_eq!(err.code, "invalid_frame");
    }

    #[test]
    fn encoded_frame_is_single_line() {
        let frame = Frame::new(events::TASK_UPDATE, Some(json!({"a": "b\nc"})));
        let bytes = frame.encode().expect("encode");
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(decode_frame(&bytes).expect("decode"), frame);
    }

    #[test]
    fn ping_frame_has_no_payload() {
        let bytes = Frame::ping().encode().expect("encode");
        assert_eq!(bytes, b"{\"event\":\"ping\"}\n".to_vec());
    }

    #[test]
    fn handshake_requires_user_id() {
        let handshake = Handshake::new("  ", "device-1");
        assert!(handshake.validate().is_err());
        assert!(Handshake::new("user-1", "device-1").validate().is_ok());
    }

    #[test]
    fn parses_flat_created_payload() {
        let update = parse_task_update(json!({
            "event_type": "task.created",
            "task_id": 5,
            "changes": {"id": 5, "title": "Buy milk"}
        }))
        .expect("update");
        assert_eq!(update.event_type, UpdateEventType::TaskCreated);
        assert_eq!(update.task_id, 5);
        assert!(update.source_device_id.is_none());
    }

    #[test]
    fn parses_broker_envelope() {
        let update = parse_task_update(json!({
            "type": "task.deleted",
            "data": {"event_type": "task.deleted", "task_id": "42", "source_device_id": "device-a"}
        }))
        .expect("update");
        assert_eq!(update.event_type, UpdateEventType::TaskDeleted);
        assert_eq!(update.task_id, 42);
        assert_eq!(update.source_device_id.as_deref(), Some("device-a"));
    }

    #[test]
    fn rejects_unknown_event_type() {
        let err = parse_task_update(json!({"event_type": "tag.added", "task_id": 1})).unwrap_err();
        assert_eq!(err.code, "unsupported_event_type");
    }

    #[test]
    fn rejects_update_without_payload() {
        let err = parse_task_update(json!({"event_type": "task.updated", "task_id": 1})).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn delete_does_not_require_payload() {
        assert!(parse_task_update(json!({"event_type": "task.deleted", "task_id": 9})).is_ok());
    }

    #[test]
    fn rejects_mismatched_payload_id() {
        let err = parse_task_update(json!({
            "event_type": "task.updated",
            "task_id": 1,
            "changes": {"id": 2}
        }))
        .unwrap_err();
        assert_eq!(err.code, "task_id_mismatch");
    }

    #[test]
    fn rejects_non_integer_task_id() {
        let err = parse_task_update(json!({
            "event_type": "task.deleted",
            "task_id": "123e4567-e89b-12d3"
        }))
        .unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn rejects_bad_timestamp() {
        let err = parse_task_update(json!({
            "event_type": "task.deleted",
            "task_id": 3,
            "timestamp": "yesterday"
        }))
        .unwrap_err();
        assert_eq!(err.code, "invalid_timestamp");
    }

    #[test]
    fn disconnect_reason_accepts_string_or_object() {
        assert_eq!(parse_disconnect_reason(&json!("io server disconnect")), "io server disconnect");
        assert_eq!(parse_disconnect_reason(&json!({"reason": "ping timeout"})), "ping timeout");
        assert_eq!(parse_disconnect_reason(&Value::Null), "unknown");
    }
}
