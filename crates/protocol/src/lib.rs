//! Socket protocol: frame envelope, event payloads, and room naming.
//!
//! Two long-lived namespaces ride on plain WebSockets:
//! 1. `/ws/chat` — browsers join task rooms and stream assistant turns
//! 2. `/ws/local-executor` — devices register, receive `task:execute`,
//!    and push `task:progress` / `task:complete` back
//!
//! Every message is one JSON [`Frame`]: colon-separated `event` name,
//! free-form `data`, and an optional client `ack` id echoed in the reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Client-chosen id; replies carrying it are acks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }

    /// Ack reply for a client frame: same event name, echoed ack id.
    pub fn ack_of(request: &Frame, data: Value) -> Self {
        Self {
            event: request.event.clone(),
            data,
            ack: request.ack,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

/// Build an `{ok: true, ...}` ack body.
pub fn ack_ok(mut extra: Value) -> Value {
    if let Value::Object(map) = &mut extra {
        map.insert("ok".into(), Value::Bool(true));
        return extra;
    }
    serde_json::json!({ "ok": true })
}

/// Build an `{ok: false, error}` ack body.
pub fn ack_err(error: impl Into<String>) -> Value {
    serde_json::json!({ "ok": false, "error": error.into() })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server → client events on `/ws/chat`.
pub mod chat_events {
    pub const START: &str = "chat:start";
    pub const CHUNK: &str = "chat:chunk";
    pub const DONE: &str = "chat:done";
    pub const ERROR: &str = "chat:error";
    pub const CANCELLED: &str = "chat:cancelled";
    pub const MESSAGE: &str = "chat:message";
    pub const BLOCK_CREATED: &str = "chat:block_created";
    pub const BLOCK_UPDATED: &str = "chat:block_updated";
    pub const TASK_STATUS: &str = "task:status";
    pub const TASK_UPDATED: &str = "task:updated";
}

/// Events exchanged with devices on `/ws/local-executor`.
pub mod device_events {
    pub const EXECUTE: &str = "task:execute";
    pub const CANCEL: &str = "task:cancel";
    pub const PROGRESS: &str = "task:progress";
    pub const COMPLETE: &str = "task:complete";
    pub const REGISTER: &str = "device:register";
    pub const HEARTBEAT: &str = "device:heartbeat";
    pub const STATUS: &str = "device:status";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rooms
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn task_room(task_id: i64) -> String {
    format!("task:{task_id}")
}

pub fn user_room(user_id: i64) -> String {
    format!("user:{user_id}")
}

pub fn device_room(user_id: i64, device_id: &str) -> String {
    format!("device:{user_id}:{device_id}")
}

/// Split a `device:{user_id}:{device_id}` room name back apart.
pub fn parse_device_room(room: &str) -> Option<(i64, &str)> {
    let mut parts = room.splitn(3, ':');
    if parts.next()? != "device" {
        return None;
    }
    let user_id = parts.next()?.parse().ok()?;
    let device_id = parts.next()?;
    if device_id.is_empty() {
        return None;
    }
    Some((user_id, device_id))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat payloads (client → server)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskJoinPayload {
    pub task_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSendPayload {
    pub team_id: i64,
    #[serde(default)]
    pub task_id: Option<i64>,
    pub message: String,
    #[serde(default)]
    pub attachment_ids: Vec<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "d_true")]
    pub enable_tools: bool,
    #[serde(default)]
    pub enable_web_search: bool,
    #[serde(default)]
    pub enable_clarification: bool,
    #[serde(default = "d_true")]
    pub enable_deep_thinking: bool,
    #[serde(default)]
    pub force_override_bot_model: Option<String>,
    #[serde(default)]
    pub is_group_chat: bool,
    #[serde(default)]
    pub contexts: Vec<Value>,
    #[serde(default)]
    pub additional_skills: Vec<String>,
}

fn d_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCancelPayload {
    pub subtask_id: i64,
    #[serde(default)]
    pub partial_content: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRetryPayload {
    pub task_id: i64,
    pub subtask_id: i64,
    /// When true, `force_override_bot_model` from this payload wins even
    /// if it is empty (meaning "back to the bot default").
    #[serde(default)]
    pub use_model_override: bool,
    #[serde(default)]
    pub force_override_bot_model: Option<String>,
    #[serde(default)]
    pub force_override_bot_model_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResumePayload {
    pub task_id: i64,
    pub subtask_id: i64,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistorySyncPayload {
    pub task_id: i64,
    #[serde(default)]
    pub after_message_id: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRegisterPayload {
    pub device_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceHeartbeatPayload {
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceStatusPayload {
    pub device_id: String,
    pub status: DeviceStatus,
}

/// Periodic partial result from a device. `result.value` carries the
/// full accumulated text; the server computes the delta.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskProgressPayload {
    pub device_id: String,
    pub subtask_id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskCompletePayload {
    pub device_id: String,
    pub subtask_id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_with_ack() {
        let frame = Frame {
            event: "chat:send".into(),
            data: serde_json::json!({"message": "hi"}),
            ack: Some(4),
        };
        let back = Frame::parse(&frame.to_json()).unwrap();
        assert_eq!(back.event, "chat:send");
        assert_eq!(back.ack, Some(4));
        assert_eq!(back.data["message"], "hi");
    }

    #[test]
    fn ack_of_echoes_id() {
        let request = Frame {
            event: "task:join".into(),
            data: Value::Null,
            ack: Some(9),
        };
        let reply = Frame::ack_of(&request, ack_ok(serde_json::json!({"streaming": null})));
        assert_eq!(reply.ack, Some(9));
        assert_eq!(reply.data["ok"], true);
        assert_eq!(reply.data["streaming"], Value::Null);
    }

    #[test]
    fn ack_err_shape() {
        let body = ack_err("permission denied");
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "permission denied");
    }

    #[test]
    fn room_names() {
        assert_eq!(task_room(42), "task:42");
        assert_eq!(user_room(1), "user:1");
        assert_eq!(device_room(1, "abc"), "device:1:abc");
    }

    #[test]
    fn device_room_parse() {
        assert_eq!(parse_device_room("device:1:abc"), Some((1, "abc")));
        assert_eq!(parse_device_room("device:1:"), None);
        assert_eq!(parse_device_room("user:1"), None);
        assert_eq!(parse_device_room("device:x:abc"), None);
        // Device ids may themselves contain colons.
        assert_eq!(parse_device_room("device:7:a:b"), Some((7, "a:b")));
    }

    #[test]
    fn chat_send_defaults() {
        let payload: ChatSendPayload =
            serde_json::from_str(r#"{"team_id": 5, "message": "hello @crew"}"#).unwrap();
        assert!(payload.enable_tools);
        assert!(payload.enable_deep_thinking);
        assert!(!payload.is_group_chat);
        assert!(payload.task_id.is_none());
        assert!(payload.attachment_ids.is_empty());
    }

    #[test]
    fn device_status_parse() {
        let payload: DeviceStatusPayload =
            serde_json::from_str(r#"{"device_id": "abc", "status": "busy"}"#).unwrap();
        assert_eq!(payload.status, DeviceStatus::Busy);
    }

    #[test]
    fn progress_payload_with_result() {
        let payload: TaskProgressPayload = serde_json::from_str(
            r#"{"device_id":"abc","subtask_id":7,"result":{"value":"partial"}}"#,
        )
        .unwrap();
        assert_eq!(payload.subtask_id, 7);
        assert_eq!(payload.result.unwrap()["value"], "partial");
    }
}
