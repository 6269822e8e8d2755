//! `/ws/local-executor` — the device namespace.
//!
//! Devices authenticate with a user JWT, register with an id and a
//! display name, heartbeat every ~30 s, and receive `task:execute`
//! pushes in their `device:{user}:{device}` room. Inbound progress and
//! completion events are ownership-checked against the subtask's
//! recorded executor before touching anything.
//!
//! Offsets: a device reports the *full* accumulated text each time; the
//! server computes the missing suffix from `_last_emitted_offset` and
//! emits only the delta.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use tm_domain::task::{SubtaskPatch, SubtaskStatus};
use tm_domain::{Error, Result, Subtask};
use tm_protocol::{
    ack_err, ack_ok, device_events, device_room, user_room, DeviceHeartbeatPayload,
    DeviceRegisterPayload, DeviceStatusPayload, Frame, TaskCompletePayload, TaskProgressPayload,
};

use crate::state::AppState;
use crate::ws::rooms::ConnectedSocket;
use crate::ws::{spawn_writer, wait_for_auth};

/// Presence TTL; refreshed by 30 s heartbeats with headroom for jitter.
const PRESENCE_TTL_SECS: u64 = 90;

pub const DEVICE_DISCONNECTED_MESSAGE: &str = "Device disconnected unexpectedly";

fn presence_key(user_id: i64, device_id: &str) -> String {
    format!("device:presence:{user_id}:{device_id}")
}

pub fn device_executor_name(device_id: &str) -> String {
    format!("device-{device_id}")
}

/// Missing suffix of the accumulated text given the last emitted offset.
/// A device restart can shrink the text; the offset is clamped.
pub fn compute_delta(full: &str, last_offset: usize) -> (String, usize) {
    let clamped = last_offset.min(full.len());
    // Guard against a clamp landing mid-character.
    let mut start = clamped;
    while start < full.len() && !full.is_char_boundary(start) {
        start += 1;
    }
    (full[start..].to_owned(), full.len())
}

pub async fn device_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct DeviceSession {
    sid: String,
    user_id: i64,
    user_name: String,
    /// Devices registered over this socket, failed over on disconnect.
    devices: Mutex<Vec<String>>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Frame>(64);
    let writer = spawn_writer(ws_sink, rx);

    let Some(claims) = wait_for_auth(&mut ws_stream, &state).await else {
        writer.abort();
        return;
    };

    let session = DeviceSession {
        sid: uuid::Uuid::new_v4().to_string(),
        user_id: claims.sub,
        user_name: claims.name.clone(),
        devices: Mutex::new(Vec::new()),
    };
    state.rooms.register(ConnectedSocket {
        sid: session.sid.clone(),
        user_id: session.user_id,
        user_name: session.user_name.clone(),
        sink: tx.clone(),
    });
    let _ = tx
        .send(Frame::new("auth", ack_ok(serde_json::json!({}))))
        .await;

    tracing::info!(
        sid = %session.sid,
        user_id = session.user_id,
        "device socket connected"
    );

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                let Ok(frame) = Frame::parse(&text) else {
                    tracing::debug!(sid = %session.sid, "ignoring unparseable device frame");
                    continue;
                };
                let body = match dispatch_event(&state, &session, &frame).await {
                    Ok(body) => ack_ok(body),
                    Err(e) => ack_err(e.to_string()),
                };
                let _ = tx.send(Frame::ack_of(&frame, body)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    handle_disconnect(&state, &session).await;
    state.rooms.remove(&session.sid);
    writer.abort();
}

async fn dispatch_event(
    state: &AppState,
    session: &DeviceSession,
    frame: &Frame,
) -> Result<Value> {
    match frame.event.as_str() {
        device_events::REGISTER => on_register(state, session, parse(frame)?).await,
        device_events::HEARTBEAT => on_heartbeat(state, session, parse(frame)?).await,
        device_events::STATUS => on_status(state, session, parse(frame)?).await,
        device_events::PROGRESS => on_progress(state, session, parse(frame)?).await,
        device_events::COMPLETE => on_complete(state, session, parse(frame)?).await,
        other => Err(Error::Validation(format!("unknown event: {other}"))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T> {
    serde_json::from_value(frame.data.clone())
        .map_err(|e| Error::Validation(format!("{}: {e}", frame.event)))
}

/// Inbound events must come from the device the subtask was assigned to.
fn check_ownership(subtask: &Subtask, device_id: &str) -> Result<()> {
    let expected = device_executor_name(device_id);
    if subtask.executor_name.as_deref() == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(Error::Permission(
            "subtask does not belong to this device".into(),
        ))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration & presence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn on_register(
    state: &AppState,
    session: &DeviceSession,
    payload: DeviceRegisterPayload,
) -> Result<Value> {
    if payload.device_id.is_empty() {
        return Err(Error::Validation("device_id is empty".into()));
    }

    state.rooms.join(
        &session.sid,
        &device_room(session.user_id, &payload.device_id),
    );
    session.devices.lock().push(payload.device_id.clone());

    if let Err(e) = state
        .store
        .set_json(
            &presence_key(session.user_id, &payload.device_id),
            &serde_json::json!({
                "device_id": payload.device_id,
                "name": payload.name,
                "user_id": session.user_id,
            }),
            Some(PRESENCE_TTL_SECS),
        )
        .await
    {
        tracing::warn!(device_id = %payload.device_id, error = %e, "presence write failed");
    }

    state
        .rooms
        .emit_to_room(
            &user_room(session.user_id),
            &Frame::new(
                device_events::STATUS,
                serde_json::json!({
                    "device_id": payload.device_id,
                    "status": "online",
                    "name": payload.name,
                }),
            ),
            None,
        )
        .await;

    tracing::info!(
        device_id = %payload.device_id,
        user_id = session.user_id,
        "device registered"
    );
    Ok(serde_json::json!({ "device_id": payload.device_id }))
}

async fn on_heartbeat(
    state: &AppState,
    session: &DeviceSession,
    payload: DeviceHeartbeatPayload,
) -> Result<Value> {
    let key = presence_key(session.user_id, &payload.device_id);
    if let Ok(Some(presence)) = state.store.get_string(&key).await {
        let _ = state
            .store
            .set_string(&key, &presence, Some(PRESENCE_TTL_SECS))
            .await;
    }
    Ok(serde_json::json!({}))
}

async fn on_status(
    state: &AppState,
    session: &DeviceSession,
    payload: DeviceStatusPayload,
) -> Result<Value> {
    state
        .rooms
        .emit_to_room(
            &user_room(session.user_id),
            &Frame::new(
                device_events::STATUS,
                serde_json::json!({
                    "device_id": payload.device_id,
                    "status": payload.status,
                }),
            ),
            None,
        )
        .await;
    Ok(serde_json::json!({}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution relay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn on_progress(
    state: &AppState,
    session: &DeviceSession,
    payload: TaskProgressPayload,
) -> Result<Value> {
    let subtask = state
        .data
        .get_subtask(payload.subtask_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("subtask {}", payload.subtask_id)))?;
    check_ownership(&subtask, &payload.device_id)?;

    // A worker posting COMPLETED through the progress event means the
    // task is finished.
    if payload.status.as_deref() == Some("COMPLETED") {
        return complete_subtask(
            state,
            session,
            subtask,
            TaskCompletePayload {
                device_id: payload.device_id,
                subtask_id: payload.subtask_id,
                status: payload.status,
                progress: payload.progress,
                result: payload.result,
                error_message: None,
            },
        )
        .await;
    }

    let mut patch = SubtaskPatch::default();
    if let Some(progress) = payload.progress {
        patch.progress = Some(progress);
    }

    let mut delta = String::new();
    let mut last_offset = 0usize;
    if let Some(result) = &payload.result {
        let full = result.get("value").and_then(Value::as_str).unwrap_or("");
        last_offset = subtask
            .result_view()
            .map(|v| v.last_emitted_offset())
            .unwrap_or(0);
        let (suffix, new_offset) = compute_delta(full, last_offset);
        delta = suffix;

        patch.result = Some(serde_json::json!({
            "value": full,
            "thinking": result.get("thinking").cloned().unwrap_or(Value::Null),
            "workbench": result.get("workbench").cloned().unwrap_or(Value::Null),
            "_last_emitted_offset": new_offset,
        }));

        if let Err(e) = state
            .sessions
            .save_streaming_content(subtask.id, full)
            .await
        {
            tracing::debug!(subtask_id = subtask.id, error = %e, "replay cache write failed");
        }
    }
    state.data.update_subtask(subtask.id, patch).await?;

    // Only the missing suffix goes over the wire; the internal offset
    // key never does.
    if !delta.is_empty() {
        state
            .ws
            .emit_chat_chunk(
                subtask.task_id,
                subtask.id,
                &delta,
                last_offset as i64,
                None,
                None,
                None,
            )
            .await;
    }

    Ok(serde_json::json!({}))
}

async fn on_complete(
    state: &AppState,
    session: &DeviceSession,
    payload: TaskCompletePayload,
) -> Result<Value> {
    let subtask = state
        .data
        .get_subtask(payload.subtask_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("subtask {}", payload.subtask_id)))?;
    check_ownership(&subtask, &payload.device_id)?;
    complete_subtask(state, session, subtask, payload).await
}

async fn complete_subtask(
    state: &AppState,
    session: &DeviceSession,
    subtask: Subtask,
    payload: TaskCompletePayload,
) -> Result<Value> {
    let failed = payload.status.as_deref() == Some("FAILED");
    let status = if failed {
        SubtaskStatus::Failed
    } else {
        SubtaskStatus::Completed
    };

    let mut patch = SubtaskPatch::status(status);
    patch.progress = Some(payload.progress.unwrap_or(100));
    if let Some(result) = payload.result.clone() {
        patch.result = Some(result);
    }
    if let Some(error) = payload.error_message.clone() {
        patch.error_message = Some(error);
    }
    let updated = state.data.update_subtask(subtask.id, patch).await?;

    if failed {
        state
            .ws
            .emit_chat_error(
                subtask.task_id,
                subtask.id,
                payload.error_message.as_deref().unwrap_or("Unknown error"),
                Some(subtask.message_id),
            )
            .await;
    } else {
        let value_len = updated.result_value().len() as i64;
        state
            .ws
            .emit_chat_done(
                subtask.task_id,
                subtask.id,
                value_len,
                updated.result.as_ref(),
                Some(subtask.message_id),
            )
            .await;
    }
    state
        .ws
        .emit_task_status(
            session.user_id,
            subtask.task_id,
            status.as_str(),
            Some(payload.progress.unwrap_or(100)),
        )
        .await;

    let _ = state.sessions.delete_streaming_content(subtask.id).await;
    let _ = state
        .sessions
        .publish_done(subtask.id, updated.result.as_ref())
        .await;
    let _ = state.sessions.clear_task_streaming(subtask.task_id).await;
    state.cancels.unregister_stream(subtask.id).await;

    tracing::info!(
        subtask_id = subtask.id,
        status = status.as_str(),
        "device task completed"
    );
    Ok(serde_json::json!({ "subtask_id": subtask.id }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Disconnect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_disconnect(state: &AppState, session: &DeviceSession) {
    let devices = session.devices.lock().clone();
    for device_id in devices {
        let _ = state
            .store
            .delete(&presence_key(session.user_id, &device_id))
            .await;

        let executor_name = device_executor_name(&device_id);
        let running = match state
            .data
            .find_running_subtasks_by_executor(&executor_name)
            .await
        {
            Ok(running) => running,
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "disconnect sweep failed");
                continue;
            }
        };

        let mut failed_tasks = std::collections::HashSet::new();
        for subtask in running {
            tracing::warn!(
                subtask_id = subtask.id,
                device_id = %device_id,
                "failing subtask after device disconnect"
            );
            if let Err(e) = state
                .data
                .update_subtask(
                    subtask.id,
                    SubtaskPatch::status(SubtaskStatus::Failed)
                        .with_error(DEVICE_DISCONNECTED_MESSAGE),
                )
                .await
            {
                tracing::error!(subtask_id = subtask.id, error = %e, "disconnect failure write failed");
                continue;
            }
            state
                .ws
                .emit_chat_error(
                    subtask.task_id,
                    subtask.id,
                    DEVICE_DISCONNECTED_MESSAGE,
                    Some(subtask.message_id),
                )
                .await;
            state
                .ws
                .emit_chat_done(
                    subtask.task_id,
                    subtask.id,
                    0,
                    None,
                    Some(subtask.message_id),
                )
                .await;
            failed_tasks.insert(subtask.task_id);
        }

        for task_id in failed_tasks {
            state
                .ws
                .emit_task_status(session.user_id, task_id, "FAILED", None)
                .await;
        }

        state
            .rooms
            .emit_to_room(
                &user_room(session.user_id),
                &Frame::new(
                    device_events::STATUS,
                    serde_json::json!({
                        "device_id": device_id,
                        "status": "offline",
                    }),
                ),
                None,
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
    use crate::data::{DataService, MemoryDataService, NewSubtask};
    use crate::state::testing::test_state;
    use crate::state::AppState;
    use std::sync::Arc;
    use tm_domain::task::SubtaskRole;

    fn device_session(state: &AppState, sid: &str) -> (DeviceSession, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        state.rooms.register(ConnectedSocket {
            sid: sid.into(),
            user_id: 1,
            user_name: "alice".into(),
            sink: tx,
        });
        state.rooms.join(sid, &user_room(1));
        (
            DeviceSession {
                sid: sid.into(),
                user_id: 1,
                user_name: "alice".into(),
                devices: Mutex::new(vec![]),
            },
            rx,
        )
    }

    async fn seed_device_turn(data: &Arc<MemoryDataService>, device_id: &str) -> (i64, i64) {
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
                parent_id: Some(1),
                bot_ids: vec![],
                team_id: None,
                metadata: None,
            })
            .await
            .unwrap();
        let patch = SubtaskPatch {
            status: Some(SubtaskStatus::Running),
            executor_name: Some(device_executor_name(device_id)),
            executor_namespace: Some("user-1".into()),
            ..Default::default()
        };
        data.update_subtask(subtask.id, patch).await.unwrap();
        (task.id, subtask.id)
    }

    #[test]
    fn delta_computation() {
        assert_eq!(compute_delta("hello", 0), ("hello".into(), 5));
        assert_eq!(compute_delta("hello", 2), ("llo".into(), 5));
        assert_eq!(compute_delta("hello", 5), ("".into(), 5));
        // Shrunken text clamps instead of panicking.
        assert_eq!(compute_delta("hi", 10), ("".into(), 2));
        // An offset landing mid-character advances to the next boundary.
        assert_eq!(compute_delta("héllo", 2), ("llo".into(), 6));
    }

    #[test]
    fn ownership_check() {
        let mut subtask = Subtask::new(7, 42, 2, SubtaskRole::Assistant, 1);
        subtask.executor_name = Some("device-abc".into());
        assert!(check_ownership(&subtask, "abc").is_ok());
        assert!(check_ownership(&subtask, "other").is_err());
        subtask.executor_name = None;
        assert!(check_ownership(&subtask, "abc").is_err());
    }

    #[tokio::test]
    async fn progress_emits_delta_only() {
        let (state, data) = test_state();
        let (session, mut rx) = device_session(&state, "dev1");
        let (task_id, subtask_id) = seed_device_turn(&data, "abc").await;
        state.rooms.join("dev1", &tm_protocol::task_room(task_id));

        // First progress: everything is new.
        let progress: TaskProgressPayload = serde_json::from_value(serde_json::json!({
            "device_id": "abc",
            "subtask_id": subtask_id,
            "result": {"value": "hel"},
        }))
        .unwrap();
        on_progress(&state, &session, progress).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "chat:chunk");
        assert_eq!(frame.data["content"], "hel");
        assert_eq!(frame.data["offset"], 0);

        // Second progress: only the suffix is emitted.
        let progress: TaskProgressPayload = serde_json::from_value(serde_json::json!({
            "device_id": "abc",
            "subtask_id": subtask_id,
            "result": {"value": "hello"},
        }))
        .unwrap();
        on_progress(&state, &session, progress).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.data["content"], "lo");
        assert_eq!(frame.data["offset"], 3);

        // Offset bookkeeping persisted, but never emitted.
        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(
            subtask.result_view().unwrap().last_emitted_offset(),
            5
        );
        assert!(frame.data.get("_last_emitted_offset").is_none());
    }

    #[tokio::test]
    async fn progress_from_wrong_device_rejected() {
        let (state, data) = test_state();
        let (session, _rx) = device_session(&state, "dev1");
        let (_task_id, subtask_id) = seed_device_turn(&data, "abc").await;

        let progress: TaskProgressPayload = serde_json::from_value(serde_json::json!({
            "device_id": "intruder",
            "subtask_id": subtask_id,
            "result": {"value": "stolen"},
        }))
        .unwrap();
        let err = on_progress(&state, &session, progress).await.unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[tokio::test]
    async fn progress_with_completed_status_finishes_task() {
        let (state, data) = test_state();
        let (session, mut rx) = device_session(&state, "dev1");
        let (task_id, subtask_id) = seed_device_turn(&data, "abc").await;
        state.rooms.join("dev1", &tm_protocol::task_room(task_id));

        let progress: TaskProgressPayload = serde_json::from_value(serde_json::json!({
            "device_id": "abc",
            "subtask_id": subtask_id,
            "status": "COMPLETED",
            "result": {"value": "all done"},
        }))
        .unwrap();
        on_progress(&state, &session, progress).await.unwrap();

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Completed);

        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(frame.event);
        }
        assert!(events.contains(&"chat:done".to_string()));
        assert!(events.contains(&"task:status".to_string()));
    }

    #[tokio::test]
    async fn complete_failed_emits_error() {
        let (state, data) = test_state();
        let (session, mut rx) = device_session(&state, "dev1");
        let (task_id, subtask_id) = seed_device_turn(&data, "abc").await;
        state.rooms.join("dev1", &tm_protocol::task_room(task_id));

        let complete: TaskCompletePayload = serde_json::from_value(serde_json::json!({
            "device_id": "abc",
            "subtask_id": subtask_id,
            "status": "FAILED",
            "error_message": "tool crashed",
        }))
        .unwrap();
        on_complete(&state, &session, complete).await.unwrap();

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Failed);
        assert_eq!(subtask.error_message.as_deref(), Some("tool crashed"));

        let task = data.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, Some(SubtaskStatus::Failed));

        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(frame.event);
        }
        assert!(events.contains(&"chat:error".to_string()));
        assert!(events.contains(&"task:status".to_string()));
    }

    #[tokio::test]
    async fn disconnect_fails_running_subtasks() {
        let (state, data) = test_state();
        let (session, mut rx) = device_session(&state, "dev1");
        let (task_id, subtask_id) = seed_device_turn(&data, "abc").await;
        state.rooms.join("dev1", &tm_protocol::task_room(task_id));
        session.devices.lock().push("abc".into());

        handle_disconnect(&state, &session).await;

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Failed);
        assert_eq!(
            subtask.error_message.as_deref(),
            Some(DEVICE_DISCONNECTED_MESSAGE)
        );

        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push((frame.event, frame.data));
        }
        assert!(events.iter().any(|(e, _)| e == "chat:error"));
        assert!(events
            .iter()
            .any(|(e, d)| e == "task:status" && d["status"] == "FAILED"));
        assert!(events
            .iter()
            .any(|(e, d)| e == "device:status" && d["status"] == "offline"));
    }
}
