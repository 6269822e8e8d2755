//! The `ExecutionEvent` — one step of a streaming response.
//!
//! Events are produced by executors (SSE stream, device socket, HTTP
//! callback) and consumed by emitters. The same record serializes to an
//! SSE `data:` frame, a WebSocket push, or a callback POST body.

use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Chunk,
    Thinking,
    ToolStart,
    ToolResult,
    Progress,
    Done,
    Error,
    Cancelled,
}

impl EventType {
    /// Parse an event type, mapping anything unrecognised to `Chunk`.
    ///
    /// Executors occasionally grow new event kinds; treating them as text
    /// deltas keeps old backends forward-compatible with new workers.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "start" => Self::Start,
            "chunk" => Self::Chunk,
            "thinking" => Self::Thinking,
            "tool_start" => Self::ToolStart,
            "tool_result" => Self::ToolResult,
            "progress" => Self::Progress,
            "done" => Self::Done,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            _ => Self::Chunk,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Chunk => "chunk",
            Self::Thinking => "thinking",
            Self::ToolStart => "tool_start",
            Self::ToolResult => "tool_result",
            Self::Progress => "progress",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// DONE, ERROR and CANCELLED close the stream: any emitter's terminal
    /// path shuts its downstream and later events are dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Err(D::Error::custom("empty event type"));
        }
        Ok(EventType::parse_lossy(&raw))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub task_id: i64,
    pub subtask_id: i64,
    /// Global ordering key within the task (copied from the subtask).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    /// Text delta for chunk/thinking events.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    /// Byte offset of this delta inside the accumulated response.
    #[serde(default)]
    pub offset: i64,
    /// Opaque result bag; see [`ResultView`] for typed access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 0-100 for progress events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<Value>,
    /// Type-specific extras: `shell_type` on start, `block_id` /
    /// `block_offset` on chunk, `status` on tool_result, `task_type`
    /// on callback events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ExecutionEvent {
    pub fn new(event_type: EventType, task_id: i64, subtask_id: i64) -> Self {
        Self {
            event_type,
            task_id,
            subtask_id,
            message_id: None,
            content: String::new(),
            offset: 0,
            result: None,
            error: None,
            progress: None,
            status: None,
            tool_use_id: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            data: None,
        }
    }

    pub fn start(task_id: i64, subtask_id: i64, message_id: Option<i64>, shell_type: &str) -> Self {
        let mut event = Self::new(EventType::Start, task_id, subtask_id);
        event.message_id = message_id;
        event.data = Some(serde_json::json!({ "shell_type": shell_type }));
        event
    }

    pub fn chunk(task_id: i64, subtask_id: i64, content: impl Into<String>, offset: i64) -> Self {
        let mut event = Self::new(EventType::Chunk, task_id, subtask_id);
        event.content = content.into();
        event.offset = offset;
        event
    }

    pub fn done(task_id: i64, subtask_id: i64, result: Option<Value>) -> Self {
        let mut event = Self::new(EventType::Done, task_id, subtask_id);
        event.result = result;
        event
    }

    pub fn error(task_id: i64, subtask_id: i64, error: impl Into<String>) -> Self {
        let mut event = Self::new(EventType::Error, task_id, subtask_id);
        event.error = Some(error.into());
        event
    }

    pub fn cancelled(task_id: i64, subtask_id: i64) -> Self {
        Self::new(EventType::Cancelled, task_id, subtask_id)
    }

    pub fn progress(task_id: i64, subtask_id: i64, progress: u8, status: Option<String>) -> Self {
        let mut event = Self::new(EventType::Progress, task_id, subtask_id);
        event.progress = Some(progress);
        event.status = status;
        event
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    /// Shell type carried by start events (`data.shell_type`), defaulting
    /// to "Chat".
    pub fn shell_type(&self) -> &str {
        self.data
            .as_ref()
            .and_then(|d| d.get("shell_type"))
            .and_then(Value::as_str)
            .unwrap_or("Chat")
    }

    /// Worker classification stamped on callback events (`data.task_type`).
    pub fn task_type(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("task_type"))
            .and_then(Value::as_str)
    }

    pub fn result_view(&self) -> Option<ResultView<'_>> {
        self.result.as_ref().map(ResultView)
    }

    /// Render as a single SSE frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".into());
        format!("data: {body}\n\n")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed result view
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed accessor over the opaque `result` bag carried by done events and
/// persisted subtasks.
///
/// The bag stays `serde_json::Value` at the boundary; this view is the
/// only sanctioned way to read its well-known keys.
#[derive(Debug, Clone, Copy)]
pub struct ResultView<'a>(pub &'a Value);

impl<'a> ResultView<'a> {
    pub fn value(&self) -> &'a str {
        self.0.get("value").and_then(Value::as_str).unwrap_or("")
    }

    pub fn thinking(&self) -> Option<&'a Value> {
        self.0.get("thinking").filter(|v| !v.is_null())
    }

    pub fn workbench(&self) -> Option<&'a Value> {
        self.0.get("workbench").filter(|v| !v.is_null())
    }

    pub fn silent_exit(&self) -> bool {
        self.0
            .get("silent_exit")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn blocks(&self) -> Option<&'a Value> {
        self.0.get("blocks").filter(|v| !v.is_null())
    }

    /// Offset bookkeeping used to compute deltas for reconnecting
    /// subscribers. Internal: must never appear in emitted payloads.
    pub fn last_emitted_offset(&self) -> usize {
        self.0
            .get("_last_emitted_offset")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize
    }
}

/// Merge accumulated streamed text into a result bag, supplying the bag
/// when the terminal event carried none.
pub fn merge_result_value(result: Option<Value>, accumulated: &str) -> Value {
    match result {
        Some(Value::Object(mut map)) => {
            if !map.contains_key("value") {
                map.insert("value".into(), Value::String(accumulated.to_owned()));
            }
            Value::Object(map)
        }
        Some(other) => other,
        None => serde_json::json!({ "value": accumulated }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_chunk() {
        let event = ExecutionEvent::chunk(42, 7, "hello", 5);
        let json = serde_json::to_string(&event).unwrap();
        let back: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, EventType::Chunk);
        assert_eq!(back.task_id, 42);
        assert_eq!(back.subtask_id, 7);
        assert_eq!(back.content, "hello");
        assert_eq!(back.offset, 5);
    }

    #[test]
    fn unknown_type_decodes_as_chunk() {
        let back: ExecutionEvent = serde_json::from_str(
            r#"{"type":"telemetry_blip","task_id":1,"subtask_id":2,"content":"x"}"#,
        )
        .unwrap();
        assert_eq!(back.event_type, EventType::Chunk);
        assert_eq!(back.content, "x");
    }

    #[test]
    fn terminal_classification() {
        assert!(EventType::Done.is_terminal());
        assert!(EventType::Error.is_terminal());
        assert!(EventType::Cancelled.is_terminal());
        assert!(!EventType::Start.is_terminal());
        assert!(!EventType::Chunk.is_terminal());
        assert!(!EventType::Progress.is_terminal());
    }

    #[test]
    fn start_carries_shell_type() {
        let event = ExecutionEvent::start(1, 2, Some(3), "ClaudeCode");
        assert_eq!(event.shell_type(), "ClaudeCode");
        assert_eq!(event.message_id, Some(3));
    }

    #[test]
    fn shell_type_defaults_to_chat() {
        let event = ExecutionEvent::done(1, 2, None);
        assert_eq!(event.shell_type(), "Chat");
    }

    #[test]
    fn sse_frame_shape() {
        let event = ExecutionEvent::chunk(1, 2, "hi", 0);
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn result_view_reads_known_keys() {
        let result = serde_json::json!({
            "value": "answer",
            "thinking": "because",
            "silent_exit": true,
            "_last_emitted_offset": 6,
        });
        let view = ResultView(&result);
        assert_eq!(view.value(), "answer");
        assert!(view.thinking().is_some());
        assert!(view.workbench().is_none());
        assert!(view.silent_exit());
        assert_eq!(view.last_emitted_offset(), 6);
    }

    #[test]
    fn merge_result_supplies_missing_value() {
        let merged = merge_result_value(None, "streamed");
        assert_eq!(ResultView(&merged).value(), "streamed");

        let merged = merge_result_value(Some(serde_json::json!({"thinking": "t"})), "streamed");
        assert_eq!(ResultView(&merged).value(), "streamed");
        assert!(ResultView(&merged).thinking().is_some());

        // An explicit value wins over the accumulator.
        let merged = merge_result_value(Some(serde_json::json!({"value": "final"})), "streamed");
        assert_eq!(ResultView(&merged).value(), "final");
    }

    #[test]
    fn empty_type_is_rejected() {
        let parsed: Result<ExecutionEvent, _> =
            serde_json::from_str(r#"{"type":"","task_id":1,"subtask_id":2}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn task_type_extraction() {
        let mut event = ExecutionEvent::done(1, 2, None);
        assert_eq!(event.task_type(), None);
        event.data = Some(serde_json::json!({"task_type": "validation"}));
        assert_eq!(event.task_type(), Some("validation"));
    }
}
