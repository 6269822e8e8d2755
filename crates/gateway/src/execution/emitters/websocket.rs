//! WebSocket emitter: pushes events into the `/ws/chat` task room.
//!
//! Event mapping:
//! - start → `chat:start`, chunk → `chat:chunk`
//! - tool_start → `chat:block_created` (synthesised pending tool block)
//! - tool_result → `chat:block_updated` (done/error)
//! - done/error/cancelled → `chat:done` / `chat:error` / `chat:cancelled`
//! - progress → `task:status` in the owning user's room

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use tm_domain::{EventType, ExecutionEvent};

use crate::data::DataService;
use crate::ws::rooms::WsEmitter;

use super::ResultEmitter;

pub struct WebSocketEmitter {
    ws: Arc<WsEmitter>,
    data: Arc<dyn DataService>,
    task_id: i64,
    subtask_id: i64,
    user_id: Option<i64>,
    closed: AtomicBool,
}

impl WebSocketEmitter {
    pub fn new(
        ws: Arc<WsEmitter>,
        data: Arc<dyn DataService>,
        task_id: i64,
        subtask_id: i64,
        user_id: Option<i64>,
    ) -> Self {
        Self {
            ws,
            data,
            task_id,
            subtask_id,
            user_id,
            closed: AtomicBool::new(false),
        }
    }

    async fn emit_block_created(&self, event: &ExecutionEvent) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let block_id = event
            .tool_use_id
            .clone()
            .unwrap_or_else(|| format!("tool-{now_ms}"));
        let mut block = serde_json::json!({
            "id": block_id,
            "type": "tool",
            "tool_use_id": event.tool_use_id,
            "tool_name": event.tool_name,
            "tool_input": event.tool_input,
            "status": "pending",
            "timestamp": now_ms,
        });
        if let Some(display) = event
            .data
            .as_ref()
            .and_then(|d| d.get("display_name"))
            .filter(|v| !v.is_null())
        {
            block["display_name"] = display.clone();
        }
        self.ws
            .emit_block_created(self.task_id, self.subtask_id, block)
            .await;
    }

    async fn emit_block_updated(&self, event: &ExecutionEvent) {
        let status = match event
            .data
            .as_ref()
            .and_then(|d| d.get("status"))
            .and_then(Value::as_str)
        {
            Some("error") => "error",
            _ => "done",
        };
        self.ws
            .emit_block_updated(
                self.task_id,
                self.subtask_id,
                event.tool_use_id.as_deref().unwrap_or(""),
                event.tool_output.as_ref(),
                status,
            )
            .await;
    }

    async fn emit_progress(&self, event: &ExecutionEvent) {
        let status = event.status.as_deref().unwrap_or("RUNNING");
        let user_id = match self.user_id {
            Some(id) => Some(id),
            // Progress goes to the user room; resolve the owner lazily.
            None => match self.data.get_task(self.task_id).await {
                Ok(Some(task)) => Some(task.user_id),
                _ => None,
            },
        };
        if let Some(user_id) = user_id {
            self.ws
                .emit_task_status(user_id, self.task_id, status, event.progress)
                .await;
        }
    }
}

#[async_trait]
impl ResultEmitter for WebSocketEmitter {
    async fn emit(&self, event: ExecutionEvent) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                subtask_id = self.subtask_id,
                event_type = event.event_type.as_str(),
                "websocket emitter closed, dropping event"
            );
            return;
        }

        match event.event_type {
            EventType::Start => {
                self.ws
                    .emit_chat_start(
                        self.task_id,
                        self.subtask_id,
                        event.message_id,
                        event.shell_type(),
                    )
                    .await;
            }
            EventType::Chunk | EventType::Thinking => {
                let block_id = event.data.as_ref().and_then(|d| d.get("block_id"));
                let block_offset = event.data.as_ref().and_then(|d| d.get("block_offset"));
                self.ws
                    .emit_chat_chunk(
                        self.task_id,
                        self.subtask_id,
                        &event.content,
                        event.offset,
                        event.result.as_ref(),
                        block_id,
                        block_offset,
                    )
                    .await;
            }
            EventType::ToolStart => self.emit_block_created(&event).await,
            EventType::ToolResult => self.emit_block_updated(&event).await,
            EventType::Done => {
                self.ws
                    .emit_chat_done(
                        self.task_id,
                        self.subtask_id,
                        event.offset,
                        event.result.as_ref(),
                        event.message_id,
                    )
                    .await;
            }
            EventType::Error => {
                self.ws
                    .emit_chat_error(
                        self.task_id,
                        self.subtask_id,
                        event.error.as_deref().unwrap_or("Unknown error"),
                        event.message_id,
                    )
                    .await;
            }
            EventType::Progress => self.emit_progress(&event).await,
            EventType::Cancelled => {
                self.ws
                    .emit_chat_cancelled(self.task_id, self.subtask_id)
                    .await;
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryDataService;
    use crate::ws::rooms::{ConnectedSocket, RoomRegistry};
    use tokio::sync::mpsc;
    use tm_protocol::Frame;

    async fn setup() -> (Arc<WsEmitter>, mpsc::Receiver<Frame>, Arc<MemoryDataService>) {
        let rooms = Arc::new(RoomRegistry::new());
        let (tx, rx) = mpsc::channel(32);
        rooms.register(ConnectedSocket {
            sid: "s1".into(),
            user_id: 1,
            user_name: "alice".into(),
            sink: tx,
        });
        rooms.join("s1", "task:42");
        rooms.join("s1", "user:1");
        (Arc::new(WsEmitter::new(rooms)), rx, Arc::new(MemoryDataService::new()))
    }

    #[tokio::test]
    async fn start_maps_to_chat_start() {
        let (ws, mut rx, data) = setup().await;
        let emitter = WebSocketEmitter::new(ws, data, 42, 7, Some(1));
        emitter.emit_start(42, 7, Some(3), "Chat").await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "chat:start");
        assert_eq!(frame.data["message_id"], 3);
        assert_eq!(frame.data["shell_type"], "Chat");
    }

    #[tokio::test]
    async fn tool_start_synthesises_pending_block() {
        let (ws, mut rx, data) = setup().await;
        let emitter = WebSocketEmitter::new(ws, data, 42, 7, Some(1));

        let mut event = ExecutionEvent::new(EventType::ToolStart, 42, 7);
        event.tool_use_id = Some("t1".into());
        event.tool_name = Some("search".into());
        event.tool_input = Some(serde_json::json!({"q": "rust"}));
        emitter.emit(event).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "chat:block_created");
        assert_eq!(frame.data["block"]["id"], "t1");
        assert_eq!(frame.data["block"]["type"], "tool");
        assert_eq!(frame.data["block"]["status"], "pending");
    }

    #[tokio::test]
    async fn tool_result_error_status() {
        let (ws, mut rx, data) = setup().await;
        let emitter = WebSocketEmitter::new(ws, data, 42, 7, Some(1));

        let mut event = ExecutionEvent::new(EventType::ToolResult, 42, 7);
        event.tool_use_id = Some("t1".into());
        event.data = Some(serde_json::json!({"status": "error"}));
        emitter.emit(event).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "chat:block_updated");
        assert_eq!(frame.data["status"], "error");
    }

    #[tokio::test]
    async fn progress_goes_to_user_room() {
        let (ws, mut rx, data) = setup().await;
        let emitter = WebSocketEmitter::new(ws, data, 42, 7, Some(1));
        emitter
            .emit(ExecutionEvent::progress(42, 7, 40, Some("RUNNING".into())))
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "task:status");
        assert_eq!(frame.data["progress"], 40);
        assert_eq!(frame.data["status"], "RUNNING");
    }

    #[tokio::test]
    async fn closed_emitter_drops_events() {
        let (ws, mut rx, data) = setup().await;
        let emitter = WebSocketEmitter::new(ws, data, 42, 7, Some(1));
        emitter.close().await;
        emitter.emit_chunk(42, 7, "late", 0).await;
        assert!(rx.try_recv().is_err());
    }
}
