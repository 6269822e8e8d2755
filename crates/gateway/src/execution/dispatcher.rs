//! The unified dispatcher: one entry point for every execution mode.
//!
//! `dispatch` routes the request, wraps the emitter with the status
//! updater, marks the subtask RUNNING, then performs the transport:
//! - **sse** — POST and consume the event stream inline, checking the
//!   cancellation flag on every iteration
//! - **websocket** — stamp the executor identity on the subtask, emit
//!   START locally, then push `task:execute` into the device room;
//!   further events arrive out-of-band through the device namespace
//! - **http_callback** — POST the wrapper to the executor manager and
//!   emit START; events arrive at `/internal/callback`
//!
//! START is always emitted on the dispatcher's own path before it
//! returns, so subscribers never see a first chunk without a prior
//! START even when later events come over a different socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use tm_domain::config::ExecutorEndpoints;
use tm_domain::task::SubtaskPatch;
use tm_domain::task::SubtaskStatus;
use tm_domain::{Error, ExecutionRequest, Result};
use tm_protocol::{device_events, parse_device_room, Frame};

use crate::data::DataService;
use crate::execution::codec::{
    drain_data_lines, event_from_stream_json, take_utf8_prefix, DONE_SENTINEL,
};
use crate::execution::emitters::{ResultEmitter, StatusUpdatingEmitter, WebSocketEmitter};
use crate::execution::router::{CommunicationMode, ExecutionRouter, ExecutionTarget};
use crate::execution::StreamServices;
use crate::ws::rooms::WsEmitter;

pub struct Dispatcher {
    router: ExecutionRouter,
    http: reqwest::Client,
    data: Arc<dyn DataService>,
    ws: Arc<WsEmitter>,
    services: StreamServices,
}

impl Dispatcher {
    pub fn new(
        endpoints: &ExecutorEndpoints,
        data: Arc<dyn DataService>,
        ws: Arc<WsEmitter>,
        services: StreamServices,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoints.dispatch_timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            router: ExecutionRouter::new(endpoints),
            http,
            data,
            ws,
            services,
        })
    }

    pub fn router(&self) -> &ExecutionRouter {
        &self.router
    }

    /// Unified dispatch entry point. `emitter` defaults to a WebSocket
    /// emitter into the task room; the status wrapper is always the
    /// outermost layer.
    pub async fn dispatch(
        &self,
        request: ExecutionRequest,
        emitter: Option<Arc<dyn ResultEmitter>>,
        device_id: Option<&str>,
    ) {
        let target = self.router.route(&request, device_id);
        tracing::info!(
            task_id = request.task_id,
            subtask_id = request.subtask_id,
            mode = ?target.mode,
            device_id = device_id.unwrap_or(""),
            "dispatching execution request"
        );

        let emitter: Arc<dyn ResultEmitter> = emitter.unwrap_or_else(|| {
            Arc::new(WebSocketEmitter::new(
                self.ws.clone(),
                self.data.clone(),
                request.task_id,
                request.subtask_id,
                request.user_id(),
            ))
        });
        let wrapped = StatusUpdatingEmitter::new(
            emitter,
            self.data.clone(),
            request.task_id,
            request.subtask_id,
        )
        .with_stream_services(self.services.clone())
        .with_user_prompt(Some(request.prompt.clone()).filter(|p| !p.is_empty()));

        // RUNNING precedes any transport work, in every mode.
        if let Err(e) = self
            .data
            .update_subtask(request.subtask_id, SubtaskPatch::status(SubtaskStatus::Running))
            .await
        {
            tracing::error!(
                subtask_id = request.subtask_id,
                error = %e,
                "failed to mark subtask running"
            );
        }

        let outcome = match target.mode {
            CommunicationMode::Sse => self.dispatch_sse(&request, &target, &wrapped).await,
            CommunicationMode::Websocket => {
                self.dispatch_websocket(&request, &target, &wrapped).await
            }
            CommunicationMode::HttpCallback => {
                self.dispatch_http_callback(&request, &target, &wrapped).await
            }
        };

        if let Err(e) = outcome {
            tracing::error!(
                task_id = request.task_id,
                subtask_id = request.subtask_id,
                error = %e,
                "dispatch failed"
            );
            wrapped
                .emit_error(request.task_id, request.subtask_id, &e.to_string())
                .await;
        }
        wrapped.close().await;
    }

    // ── SSE ─────────────────────────────────────────────────────────

    async fn dispatch_sse(
        &self,
        request: &ExecutionRequest,
        target: &ExecutionTarget,
        emitter: &StatusUpdatingEmitter,
    ) -> Result<()> {
        let url = format!("{}{}", target.url.as_deref().unwrap_or(""), target.endpoint);

        emitter
            .emit_start(
                request.task_id,
                request.subtask_id,
                request.message_id,
                request.shell_type(),
            )
            .await;

        let mut response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::http_status(response.status().as_u16(), "sse dispatch rejected"));
        }

        // Raw bytes first: network chunks split multi-byte characters,
        // so only complete UTF-8 prefixes move into the line buffer.
        let mut byte_buffer: Vec<u8> = Vec::new();
        let mut buffer = String::new();
        let mut terminal_seen = false;

        loop {
            if self.services.cancels.is_cancelled(request.subtask_id).await {
                emitter
                    .emit_cancelled(request.task_id, request.subtask_id)
                    .await;
                return Ok(());
            }

            match response.chunk().await {
                Ok(Some(bytes)) => {
                    byte_buffer.extend_from_slice(&bytes);
                    buffer.push_str(&take_utf8_prefix(&mut byte_buffer));
                    terminal_seen |= self.forward_payloads(request, &mut buffer, emitter).await;
                    if terminal_seen {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    // At EOF a dangling partial sequence can only be
                    // substituted; nothing will ever complete it.
                    if !byte_buffer.is_empty() {
                        buffer.push_str(&String::from_utf8_lossy(&byte_buffer));
                        byte_buffer.clear();
                    }
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        terminal_seen |=
                            self.forward_payloads(request, &mut buffer, emitter).await;
                    }
                    break;
                }
                Err(e) => return Err(Error::Http(e.to_string())),
            }
        }

        // An upstream that closed without a terminal still owes
        // subscribers one; synthesise it from what streamed.
        if !terminal_seen {
            emitter
                .emit_done(request.task_id, request.subtask_id, None)
                .await;
        }
        Ok(())
    }

    /// Drain complete payloads from the buffer into the emitter.
    /// Returns true once a terminal event went through.
    async fn forward_payloads(
        &self,
        request: &ExecutionRequest,
        buffer: &mut String,
        emitter: &StatusUpdatingEmitter,
    ) -> bool {
        let mut terminal = false;
        for payload in drain_data_lines(buffer) {
            if payload == DONE_SENTINEL {
                continue;
            }
            let parsed: Value = match serde_json::from_str(&payload) {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(
                        subtask_id = request.subtask_id,
                        payload = %payload.chars().take(200).collect::<String>(),
                        "skipping invalid sse payload"
                    );
                    continue;
                }
            };
            let event = event_from_stream_json(request, &parsed);
            terminal |= event.is_terminal();
            emitter.emit(event).await;
        }
        terminal
    }

    // ── WebSocket (device) ──────────────────────────────────────────

    async fn dispatch_websocket(
        &self,
        request: &ExecutionRequest,
        target: &ExecutionTarget,
        emitter: &StatusUpdatingEmitter,
    ) -> Result<()> {
        let room = target
            .room
            .as_deref()
            .ok_or_else(|| Error::Dispatch("websocket target without room".into()))?;

        // Stamp executor identity first: inbound device events are
        // ownership-checked against it.
        if let Some((user_id, device_id)) = parse_device_room(room) {
            let patch = SubtaskPatch {
                executor_name: Some(format!("device-{device_id}")),
                executor_namespace: Some(format!("user-{user_id}")),
                ..Default::default()
            };
            self.data.update_subtask(request.subtask_id, patch).await?;
        }

        emitter
            .emit_start(
                request.task_id,
                request.subtask_id,
                request.message_id,
                request.shell_type(),
            )
            .await;

        let frame = Frame::new(device_events::EXECUTE, serde_json::to_value(request)?);
        self.ws.rooms().emit_to_room(room, &frame, None).await;
        tracing::info!(
            subtask_id = request.subtask_id,
            room,
            "task pushed to device room"
        );
        // Progress and completion arrive through the device namespace.
        Ok(())
    }

    // ── HTTP + callback ─────────────────────────────────────────────

    async fn dispatch_http_callback(
        &self,
        request: &ExecutionRequest,
        target: &ExecutionTarget,
        emitter: &StatusUpdatingEmitter,
    ) -> Result<()> {
        let url = format!("{}{}", target.url.as_deref().unwrap_or(""), target.endpoint);

        let body = serde_json::json!({
            "task_id": request.task_id,
            "subtask_id": request.subtask_id,
            "executor_name": request.executor_name,
            "shell_type": request.bot.first().and_then(|b| b.shell_type.clone()),
            "payload": request,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Dispatch(format!(
                "http dispatch failed: {}",
                detail.chars().take(500).collect::<String>()
            )));
        }

        emitter
            .emit_start(
                request.task_id,
                request.subtask_id,
                request.message_id,
                request.shell_type(),
            )
            .await;
        // Subsequent events arrive via /internal/callback.
        Ok(())
    }

    // ── Cancel ──────────────────────────────────────────────────────

    /// Cancel per transport, plus the producer-side flag so in-process
    /// streaming loops abort promptly.
    pub async fn cancel(&self, request: &ExecutionRequest, device_id: Option<&str>) -> bool {
        self.services.cancels.cancel_stream(request.subtask_id).await;

        let target = self.router.route(request, device_id);
        match target.mode {
            CommunicationMode::Websocket => {
                if let Some(room) = target.room.as_deref() {
                    let frame = Frame::new(
                        device_events::CANCEL,
                        serde_json::json!({
                            "task_id": request.task_id,
                            "subtask_id": request.subtask_id,
                        }),
                    );
                    self.ws.rooms().emit_to_room(room, &frame, None).await;
                }
                true
            }
            CommunicationMode::Sse | CommunicationMode::HttpCallback => {
                let url = format!("{}/v1/cancel", target.url.as_deref().unwrap_or(""));
                match self
                    .http
                    .post(&url)
                    .json(&serde_json::json!({
                        "task_id": request.task_id,
                        "subtask_id": request.subtask_id,
                    }))
                    .send()
                    .await
                {
                    Ok(response) => response.status().is_success(),
                    Err(e) => {
                        tracing::warn!(
                            subtask_id = request.subtask_id,
                            error = %e,
                            "transport cancel failed"
                        );
                        false
                    }
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryDataService, NewSubtask};
    use crate::ws::rooms::{ConnectedSocket, RoomRegistry};
    use tm_domain::request::{BotSpec, UserRef};
    use tm_domain::task::SubtaskRole;
    use tm_state::{CancelRegistry, RunningTaskTracker, SessionCache, StateStore};
    use tokio::sync::mpsc;

    // Stream services back onto a store pointed at a closed port: the
    // transports under test never need Redis, and the cache/registry
    // writes fail and are logged, which the emitters tolerate by
    // contract.
    fn stream_services() -> StreamServices {
        let store = StateStore::new("redis://127.0.0.1:1/").unwrap();
        StreamServices {
            sessions: SessionCache::new(store.clone(), Default::default()),
            cancels: CancelRegistry::new(store.clone(), 300),
            tracker: RunningTaskTracker::new(store),
        }
    }

    fn setup() -> (Dispatcher, Arc<MemoryDataService>, Arc<RoomRegistry>) {
        let data = Arc::new(MemoryDataService::new());
        let rooms = Arc::new(RoomRegistry::new());
        let ws = Arc::new(WsEmitter::new(rooms.clone()));
        let endpoints = ExecutorEndpoints {
            chat_shell_url: "http://127.0.0.1:1".into(),
            executor_manager_url: "http://127.0.0.1:1".into(),
            dispatch_timeout_secs: 2,
            ..Default::default()
        };
        let dispatcher =
            Dispatcher::new(&endpoints, data.clone(), ws, stream_services()).unwrap();
        (dispatcher, data, rooms)
    }

    async fn seed_turn(data: &MemoryDataService) -> (i64, i64) {
        data.add_user(UserRef {
            id: 1,
            name: "alice".into(),
            ..Default::default()
        });
        let task = data
            .create_task(1, None, None, serde_json::Map::new())
            .await
            .unwrap();
        let subtask = data
            .create_subtask(NewSubtask {
                task_id: task.id,
                role: SubtaskRole::Assistant,
                user_id: 1,
                prompt: None,
                parent_id: None,
                bot_ids: vec![],
                team_id: None,
                metadata: None,
            })
            .await
            .unwrap();
        (task.id, subtask.id)
    }

    #[tokio::test]
    async fn websocket_dispatch_stamps_executor_and_pushes_frame() {
        let (dispatcher, data, rooms) = setup();
        let (task_id, subtask_id) = seed_turn(&data).await;

        // Device socket in its room.
        let (tx, mut device_rx) = mpsc::channel(8);
        rooms.register(ConnectedSocket {
            sid: "dev".into(),
            user_id: 1,
            user_name: "alice".into(),
            sink: tx,
        });
        rooms.join("dev", "device:1:abc");

        let mut request = ExecutionRequest::new(task_id, subtask_id);
        request.message_id = Some(2);
        request.user = Some(UserRef {
            id: 1,
            name: "alice".into(),
            ..Default::default()
        });
        request.bot = vec![BotSpec {
            shell_type: Some("ClaudeCode".into()),
            ..Default::default()
        }];

        dispatcher.dispatch(request, None, Some("abc")).await;

        let frame = device_rx.recv().await.unwrap();
        assert_eq!(frame.event, "task:execute");
        assert_eq!(frame.data["task_id"], task_id);

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.executor_name.as_deref(), Some("device-abc"));
        assert_eq!(subtask.executor_namespace.as_deref(), Some("user-1"));
        assert_eq!(subtask.status, SubtaskStatus::Running);
    }

    #[tokio::test]
    async fn unreachable_manager_fails_subtask() {
        let (dispatcher, data, _rooms) = setup();
        let (task_id, subtask_id) = seed_turn(&data).await;

        let mut request = ExecutionRequest::new(task_id, subtask_id);
        request.bot = vec![BotSpec {
            shell_type: Some("ClaudeCode".into()),
            ..Default::default()
        }];

        dispatcher.dispatch(request, None, None).await;

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Failed);
        assert!(subtask.error_message.is_some());

        let task = data.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, Some(SubtaskStatus::Failed));
    }
}
