//! In-memory registry of connected sockets and their room memberships,
//! plus the process-wide typed emit surface.
//!
//! Rooms are plain string names (`user:{id}`, `task:{id}`,
//! `device:{user}:{device}`). Every socket owns an mpsc sink drained by
//! its writer task; emitting to a room fans a frame out to each member
//! socket, optionally skipping the sender.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use tm_protocol::{chat_events, Frame};

/// Outbound channel to one socket's writer task.
pub type SocketSink = mpsc::Sender<Frame>;

pub struct ConnectedSocket {
    pub sid: String,
    pub user_id: i64,
    pub user_name: String,
    pub sink: SocketSink,
}

#[derive(Default)]
struct Registry {
    sockets: HashMap<String, ConnectedSocket>,
    rooms: HashMap<String, HashSet<String>>,
    memberships: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Registry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket; replaces any previous socket with the same sid.
    pub fn register(&self, socket: ConnectedSocket) {
        let sid = socket.sid.clone();
        tracing::info!(sid = %sid, user_id = socket.user_id, "socket registered");
        self.inner.write().sockets.insert(sid, socket);
    }

    /// Remove a socket and every room membership it held.
    pub fn remove(&self, sid: &str) {
        let mut inner = self.inner.write();
        if let Some(rooms) = inner.memberships.remove(sid) {
            for room in rooms {
                if let Some(members) = inner.rooms.get_mut(&room) {
                    members.remove(sid);
                    if members.is_empty() {
                        inner.rooms.remove(&room);
                    }
                }
            }
        }
        if inner.sockets.remove(sid).is_some() {
            tracing::info!(sid = %sid, "socket removed");
        }
    }

    pub fn join(&self, sid: &str, room: &str) {
        let mut inner = self.inner.write();
        inner
            .rooms
            .entry(room.to_owned())
            .or_default()
            .insert(sid.to_owned());
        inner
            .memberships
            .entry(sid.to_owned())
            .or_default()
            .insert(room.to_owned());
        tracing::debug!(sid = %sid, room = %room, "joined room");
    }

    pub fn leave(&self, sid: &str, room: &str) {
        let mut inner = self.inner.write();
        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
        if let Some(rooms) = inner.memberships.get_mut(sid) {
            rooms.remove(room);
        }
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.inner
            .read()
            .rooms
            .get(room)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn user_of(&self, sid: &str) -> Option<(i64, String)> {
        self.inner
            .read()
            .sockets
            .get(sid)
            .map(|s| (s.user_id, s.user_name.clone()))
    }

    fn sinks_for_room(&self, room: &str, skip_sid: Option<&str>) -> Vec<SocketSink> {
        let inner = self.inner.read();
        let Some(members) = inner.rooms.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|sid| Some(sid.as_str()) != skip_sid)
            .filter_map(|sid| inner.sockets.get(sid))
            .map(|s| s.sink.clone())
            .collect()
    }

    pub fn sink_of(&self, sid: &str) -> Option<SocketSink> {
        self.inner.read().sockets.get(sid).map(|s| s.sink.clone())
    }

    /// Fan a frame out to every member of a room. A full or closed sink
    /// drops the frame for that socket only.
    pub async fn emit_to_room(&self, room: &str, frame: &Frame, skip_sid: Option<&str>) {
        for sink in self.sinks_for_room(room, skip_sid) {
            if sink.send(frame.clone()).await.is_err() {
                tracing::debug!(room = %room, "dropping frame for closed socket");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WsEmitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide emit surface. Background tasks never hold sockets; they
/// hold this and address rooms.
pub struct WsEmitter {
    rooms: Arc<RoomRegistry>,
}

/// Strip internal bookkeeping keys (anything underscore-prefixed) from a
/// result bag before it crosses the wire.
pub fn sanitize_result(result: &Value) -> Value {
    match result {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl WsEmitter {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self { rooms }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    async fn to_task_room(&self, task_id: i64, event: &str, data: Value) {
        let frame = Frame::new(event, data);
        self.rooms
            .emit_to_room(&tm_protocol::task_room(task_id), &frame, None)
            .await;
    }

    async fn to_user_room(&self, user_id: i64, event: &str, data: Value) {
        let frame = Frame::new(event, data);
        self.rooms
            .emit_to_room(&tm_protocol::user_room(user_id), &frame, None)
            .await;
    }

    pub async fn emit_chat_start(
        &self,
        task_id: i64,
        subtask_id: i64,
        message_id: Option<i64>,
        shell_type: &str,
    ) {
        self.to_task_room(
            task_id,
            chat_events::START,
            serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "message_id": message_id,
                "shell_type": shell_type,
            }),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn emit_chat_chunk(
        &self,
        task_id: i64,
        subtask_id: i64,
        content: &str,
        offset: i64,
        result: Option<&Value>,
        block_id: Option<&Value>,
        block_offset: Option<&Value>,
    ) {
        let mut data = serde_json::json!({
            "task_id": task_id,
            "subtask_id": subtask_id,
            "content": content,
            "offset": offset,
        });
        if let Some(result) = result {
            data["result"] = sanitize_result(result);
        }
        if let Some(block_id) = block_id {
            data["block_id"] = block_id.clone();
        }
        if let Some(block_offset) = block_offset {
            data["block_offset"] = block_offset.clone();
        }
        self.to_task_room(task_id, chat_events::CHUNK, data).await;
    }

    pub async fn emit_block_created(&self, task_id: i64, subtask_id: i64, block: Value) {
        self.to_task_room(
            task_id,
            chat_events::BLOCK_CREATED,
            serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "block": block,
            }),
        )
        .await;
    }

    pub async fn emit_block_updated(
        &self,
        task_id: i64,
        subtask_id: i64,
        block_id: &str,
        tool_output: Option<&Value>,
        status: &str,
    ) {
        self.to_task_room(
            task_id,
            chat_events::BLOCK_UPDATED,
            serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "block_id": block_id,
                "tool_output": tool_output,
                "status": status,
            }),
        )
        .await;
    }

    pub async fn emit_chat_done(
        &self,
        task_id: i64,
        subtask_id: i64,
        offset: i64,
        result: Option<&Value>,
        message_id: Option<i64>,
    ) {
        self.to_task_room(
            task_id,
            chat_events::DONE,
            serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "offset": offset,
                "result": result.map(sanitize_result),
                "message_id": message_id,
            }),
        )
        .await;
    }

    pub async fn emit_chat_error(
        &self,
        task_id: i64,
        subtask_id: i64,
        error: &str,
        message_id: Option<i64>,
    ) {
        self.to_task_room(
            task_id,
            chat_events::ERROR,
            serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
                "error": error,
                "message_id": message_id,
            }),
        )
        .await;
    }

    pub async fn emit_chat_cancelled(&self, task_id: i64, subtask_id: i64) {
        self.to_task_room(
            task_id,
            chat_events::CANCELLED,
            serde_json::json!({
                "task_id": task_id,
                "subtask_id": subtask_id,
            }),
        )
        .await;
    }

    /// New user message, broadcast to the room except the sender socket.
    pub async fn emit_chat_message(&self, task_id: i64, data: Value, skip_sid: Option<&str>) {
        let frame = Frame::new(chat_events::MESSAGE, data);
        self.rooms
            .emit_to_room(&tm_protocol::task_room(task_id), &frame, skip_sid)
            .await;
    }

    pub async fn emit_task_status(
        &self,
        user_id: i64,
        task_id: i64,
        status: &str,
        progress: Option<u8>,
    ) {
        self.to_user_room(
            user_id,
            chat_events::TASK_STATUS,
            serde_json::json!({
                "task_id": task_id,
                "status": status,
                "progress": progress,
            }),
        )
        .await;
    }

    pub async fn emit_task_updated(&self, task_id: i64) {
        self.to_task_room(
            task_id,
            chat_events::TASK_UPDATED,
            serde_json::json!({ "task_id": task_id }),
        )
        .await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &RoomRegistry, sid: &str, user_id: i64) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(16);
        registry.register(ConnectedSocket {
            sid: sid.into(),
            user_id,
            user_name: format!("user{user_id}"),
            sink: tx,
        });
        rx
    }

    #[tokio::test]
    async fn room_broadcast_reaches_members() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "a", 1);
        let mut rx_b = connect(&registry, "b", 2);
        registry.join("a", "task:42");
        registry.join("b", "task:42");

        let frame = Frame::new("chat:chunk", serde_json::json!({"content": "hi"}));
        registry.emit_to_room("task:42", &frame, None).await;

        assert_eq!(rx_a.recv().await.unwrap().event, "chat:chunk");
        assert_eq!(rx_b.recv().await.unwrap().event, "chat:chunk");
    }

    #[tokio::test]
    async fn skip_sid_excludes_sender() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "a", 1);
        let mut rx_b = connect(&registry, "b", 2);
        registry.join("a", "task:42");
        registry.join("b", "task:42");

        let frame = Frame::new("chat:message", serde_json::json!({}));
        registry.emit_to_room("task:42", &frame, Some("a")).await;

        assert_eq!(rx_b.recv().await.unwrap().event, "chat:message");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_cleans_memberships() {
        let registry = RoomRegistry::new();
        let _rx = connect(&registry, "a", 1);
        registry.join("a", "task:42");
        registry.join("a", "user:1");
        assert_eq!(registry.room_size("task:42"), 1);

        registry.remove("a");
        assert_eq!(registry.room_size("task:42"), 0);
        assert_eq!(registry.room_size("user:1"), 0);
        assert!(registry.user_of("a").is_none());
    }

    #[tokio::test]
    async fn leave_single_room() {
        let registry = RoomRegistry::new();
        let _rx = connect(&registry, "a", 1);
        registry.join("a", "task:42");
        registry.join("a", "task:43");
        registry.leave("a", "task:42");
        assert_eq!(registry.room_size("task:42"), 0);
        assert_eq!(registry.room_size("task:43"), 1);
    }

    #[test]
    fn sanitize_strips_internal_keys() {
        let result = serde_json::json!({
            "value": "v",
            "_last_emitted_offset": 12,
            "thinking": null,
        });
        let clean = sanitize_result(&result);
        assert_eq!(clean["value"], "v");
        assert!(clean.get("_last_emitted_offset").is_none());
        assert!(clean.get("thinking").is_some());
    }

    #[tokio::test]
    async fn ws_emitter_done_sanitizes_result() {
        let registry = Arc::new(RoomRegistry::new());
        let mut rx = connect(&registry, "a", 1);
        registry.join("a", "task:42");
        let emitter = WsEmitter::new(registry.clone());

        let result = serde_json::json!({"value": "v", "_last_emitted_offset": 5});
        emitter
            .emit_chat_done(42, 7, 1, Some(&result), Some(3))
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "chat:done");
        assert_eq!(frame.data["message_id"], 3);
        assert_eq!(frame.data["result"]["value"], "v");
        assert!(frame.data["result"].get("_last_emitted_offset").is_none());
    }
}
