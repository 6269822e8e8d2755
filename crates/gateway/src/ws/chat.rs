//! `/ws/chat` — the conversation namespace.
//!
//! Flow:
//! 1. Client connects and sends `auth {token}` (JWT); invalid → close
//! 2. Socket joins `user:{id}`; task rooms are joined explicitly
//! 3. Client events are dispatched by name; every event is acked with
//!    `{ok, …}` or `{ok: false, error}`
//!
//! Streams themselves are produced by the dispatcher; this module only
//! creates turns, triggers the pipeline, and manages membership.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use tm_domain::request::{BotSpec, UserRef};
use tm_domain::task::{SubtaskPatch, SubtaskRole, SubtaskStatus};
use tm_domain::{Error, ExecutionRequest, Result};
use tm_protocol::{
    ack_err, ack_ok, task_room, ChatCancelPayload, ChatResumePayload, ChatRetryPayload,
    ChatSendPayload, Frame, HistorySyncPayload, TaskJoinPayload,
};

use crate::data::NewSubtask;
use crate::execution::builder::{BuildOptions, ModelOverride};
use crate::state::AppState;
use crate::trigger::trigger_ai_response;
use crate::ws::rooms::ConnectedSocket;
use crate::ws::{spawn_writer, wait_for_auth};

pub async fn chat_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct Session {
    sid: String,
    user_id: i64,
    user_name: String,
    sink: mpsc::Sender<Frame>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Frame>(64);
    let writer = spawn_writer(ws_sink, rx);

    let Some(claims) = wait_for_auth(&mut ws_stream, &state).await else {
        writer.abort();
        return;
    };

    let session = Session {
        sid: uuid::Uuid::new_v4().to_string(),
        user_id: claims.sub,
        user_name: claims.name.clone(),
        sink: tx.clone(),
    };
    state.rooms.register(ConnectedSocket {
        sid: session.sid.clone(),
        user_id: session.user_id,
        user_name: session.user_name.clone(),
        sink: tx.clone(),
    });
    state
        .rooms
        .join(&session.sid, &tm_protocol::user_room(session.user_id));
    let _ = tx
        .send(Frame::new(
            "auth",
            ack_ok(serde_json::json!({ "user_id": session.user_id })),
        ))
        .await;

    tracing::info!(
        sid = %session.sid,
        user_id = session.user_id,
        "chat socket connected"
    );

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Text(text) => {
                let Ok(frame) = Frame::parse(&text) else {
                    tracing::debug!(sid = %session.sid, "ignoring unparseable frame");
                    continue;
                };
                let body = match dispatch_event(&state, &session, &frame).await {
                    Ok(body) => ack_ok(body),
                    Err(e) => ack_err(e.to_string()),
                };
                let _ = session.sink.send(Frame::ack_of(&frame, body)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.rooms.remove(&session.sid);
    writer.abort();
    tracing::info!(sid = %session.sid, "chat socket disconnected");
}

async fn dispatch_event(state: &AppState, session: &Session, frame: &Frame) -> Result<Value> {
    match frame.event.as_str() {
        "task:join" => on_task_join(state, session, parse(frame)?).await,
        "task:leave" => on_task_leave(state, session, parse(frame)?).await,
        "chat:send" => on_chat_send(state, session, parse(frame)?).await,
        "chat:cancel" => on_chat_cancel(state, session, parse(frame)?).await,
        "chat:retry" => on_chat_retry(state, session, parse(frame)?).await,
        "chat:resume" => on_chat_resume(state, session, parse(frame)?).await,
        "history:sync" => on_history_sync(state, session, parse(frame)?).await,
        other => Err(Error::Validation(format!("unknown event: {other}"))),
    }
}

fn parse<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T> {
    serde_json::from_value(frame.data.clone())
        .map_err(|e| Error::Validation(format!("{}: {e}", frame.event)))
}

async fn require_access(state: &AppState, task_id: i64, user_id: i64) -> Result<()> {
    if state.data.can_access_task(task_id, user_id).await? {
        Ok(())
    } else {
        Err(Error::Permission(format!("no access to task {task_id}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// task:join / task:leave
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn on_task_join(
    state: &AppState,
    session: &Session,
    payload: TaskJoinPayload,
) -> Result<Value> {
    require_access(state, payload.task_id, session.user_id).await?;
    state.rooms.join(&session.sid, &task_room(payload.task_id));

    // A turn already streaming? Hand back enough to resume rendering.
    let streaming = match state.data.running_assistant_subtask(payload.task_id).await? {
        Some(running) => {
            let cached = state
                .sessions
                .get_streaming_content(running.id)
                .await
                .unwrap_or(None)
                .unwrap_or_default();
            serde_json::json!({
                "subtask_id": running.id,
                "offset": cached.len(),
                "cached_content": cached,
            })
        }
        None => Value::Null,
    };
    Ok(serde_json::json!({ "streaming": streaming }))
}

async fn on_task_leave(
    state: &AppState,
    session: &Session,
    payload: TaskJoinPayload,
) -> Result<Value> {
    state.rooms.leave(&session.sid, &task_room(payload.task_id));
    Ok(serde_json::json!({}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// chat:send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Group chats trigger only when the team is @-mentioned; direct chats
/// always trigger.
pub fn should_trigger_ai(message: &str, team_name: &str, is_group_chat: bool) -> bool {
    if !is_group_chat {
        return true;
    }
    message.contains(&format!("@{team_name}"))
}

async fn on_chat_send(
    state: &AppState,
    session: &Session,
    payload: ChatSendPayload,
) -> Result<Value> {
    if payload.message.trim().is_empty() {
        return Err(Error::Validation("message is empty".into()));
    }
    let team = state
        .data
        .get_team(payload.team_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("team {}", payload.team_id)))?;

    // Existing task or a fresh one carrying the send-time model labels.
    let task = match payload.task_id {
        Some(task_id) => {
            require_access(state, task_id, session.user_id).await?;
            state
                .data
                .get_task(task_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?
        }
        None => {
            let mut labels = serde_json::Map::new();
            if let Some(model) = &payload.force_override_bot_model {
                labels.insert("forceOverrideBotModel".into(), Value::String("true".into()));
                labels.insert("modelId".into(), Value::String(model.clone()));
            }
            state
                .data
                .create_task(
                    session.user_id,
                    Some(team.id),
                    payload.title.clone(),
                    labels,
                )
                .await?
        }
    };
    state.rooms.join(&session.sid, &task_room(task.id));

    let mut metadata = None;
    if !payload.contexts.is_empty() {
        metadata = Some(serde_json::json!({ "contexts": payload.contexts }));
    }
    let user_subtask = state
        .data
        .create_subtask(NewSubtask {
            task_id: task.id,
            role: SubtaskRole::User,
            user_id: session.user_id,
            prompt: Some(payload.message.clone()),
            parent_id: None,
            bot_ids: vec![],
            team_id: Some(team.id),
            metadata,
        })
        .await?;

    // Other members see the new message; the sender already has it.
    state
        .ws
        .emit_chat_message(
            task.id,
            serde_json::json!({
                "task_id": task.id,
                "message_id": user_subtask.message_id,
                "prompt": payload.message,
                "user_id": session.user_id,
                "user_name": session.user_name,
                "created_at": user_subtask.created_at,
            }),
            Some(&session.sid),
        )
        .await;

    let mut reply = serde_json::json!({
        "task_id": task.id,
        "subtask_id": user_subtask.id,
        "message_id": user_subtask.message_id,
    });

    if should_trigger_ai(&payload.message, &team.name, payload.is_group_chat) {
        let assistant = state
            .data
            .create_subtask(NewSubtask {
                task_id: task.id,
                role: SubtaskRole::Assistant,
                user_id: session.user_id,
                prompt: None,
                parent_id: Some(user_subtask.message_id),
                bot_ids: team.members.iter().map(|m| m.bot_id).collect(),
                team_id: Some(team.id),
                metadata: None,
            })
            .await?;

        let user = state
            .data
            .get_user(session.user_id)
            .await?
            .unwrap_or(UserRef {
                id: session.user_id,
                name: session.user_name.clone(),
                ..Default::default()
            });
        let options = BuildOptions {
            message: payload.message.clone(),
            attachment_ids: payload.attachment_ids.clone(),
            enable_tools: payload.enable_tools,
            enable_web_search: payload.enable_web_search,
            enable_clarification: payload.enable_clarification,
            enable_deep_thinking: payload.enable_deep_thinking,
            additional_skills: payload.additional_skills.clone(),
            history_limit: None,
            is_subscription: false,
            contexts: payload.contexts.clone(),
            model_override: ModelOverride::FromLabels,
        };
        trigger_ai_response(state, &task, &assistant, &team, &user, options, None, None).await?;

        reply["subtask_id"] = assistant.id.into();
        reply["message_id"] = assistant.message_id.into();
    }

    Ok(reply)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// chat:cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn on_chat_cancel(
    state: &AppState,
    session: &Session,
    payload: ChatCancelPayload,
) -> Result<Value> {
    let subtask = state
        .data
        .get_subtask(payload.subtask_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("subtask {}", payload.subtask_id)))?;
    if subtask.user_id != session.user_id {
        return Err(Error::Permission("subtask belongs to another user".into()));
    }

    state.cancels.cancel_stream(subtask.id).await;

    // Non-inline transports also get an explicit transport cancel.
    if let Some(shell_type) = payload.shell_type.as_deref().filter(|s| *s != "Chat") {
        let mut request = ExecutionRequest::new(subtask.task_id, subtask.id);
        request.bot = vec![BotSpec {
            shell_type: Some(shell_type.to_owned()),
            ..Default::default()
        }];
        request.user = Some(UserRef {
            id: session.user_id,
            name: session.user_name.clone(),
            ..Default::default()
        });
        state.dispatcher.cancel(&request, None).await;
    }

    // Partial preserved as the completed answer.
    let partial = match payload.partial_content.clone() {
        Some(partial) => partial,
        None => state
            .sessions
            .get_streaming_content(subtask.id)
            .await
            .unwrap_or(None)
            .unwrap_or_default(),
    };
    let mut patch = SubtaskPatch::status(SubtaskStatus::Completed);
    if !partial.is_empty() {
        patch = patch.with_result(serde_json::json!({ "value": partial }));
    }
    let updated = state.data.update_subtask(subtask.id, patch).await?;

    let _ = state.sessions.delete_streaming_content(subtask.id).await;
    let _ = state.sessions.clear_task_streaming(subtask.task_id).await;

    state.ws.emit_chat_cancelled(subtask.task_id, subtask.id).await;
    state
        .ws
        .emit_chat_done(
            subtask.task_id,
            subtask.id,
            partial.len() as i64,
            updated.result.as_ref(),
            Some(subtask.message_id),
        )
        .await;
    state.ws.emit_task_updated(subtask.task_id).await;

    Ok(serde_json::json!({ "subtask_id": subtask.id }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// chat:retry (same-ID)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn on_chat_retry(
    state: &AppState,
    session: &Session,
    payload: ChatRetryPayload,
) -> Result<Value> {
    require_access(state, payload.task_id, session.user_id).await?;
    let task = state
        .data
        .get_task(payload.task_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("task {}", payload.task_id)))?;
    let assistant = state
        .data
        .get_subtask(payload.subtask_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("subtask {}", payload.subtask_id)))?;
    if assistant.task_id != payload.task_id || assistant.role != SubtaskRole::Assistant {
        return Err(Error::Validation("not an assistant subtask of this task".into()));
    }

    // The triggering user turn is found via parent_id == its message_id.
    let parent_message_id = assistant
        .parent_id
        .ok_or_else(|| Error::Validation("assistant subtask has no parent".into()))?;
    let user_subtask = state
        .data
        .find_user_subtask_by_message(payload.task_id, parent_message_id)
        .await?
        .ok_or_else(|| Error::NotFound("triggering user subtask".into()))?;

    let team_id = assistant
        .team_id
        .or(task.team_id)
        .ok_or_else(|| Error::Validation("task has no team".into()))?;
    let team = state
        .data
        .get_team(team_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("team {team_id}")))?;

    // Same-ID reset: the row keeps its id and message_id.
    let assistant = state.data.reset_subtask_for_retry(assistant.id).await?;

    let model_override = if payload.use_model_override {
        ModelOverride::Forced(payload.force_override_bot_model.clone())
    } else {
        ModelOverride::FromLabels
    };
    let mut options = BuildOptions::for_message(user_subtask.prompt.as_deref().unwrap_or(""));
    options.model_override = model_override;

    let user = state
        .data
        .get_user(session.user_id)
        .await?
        .unwrap_or(UserRef {
            id: session.user_id,
            name: session.user_name.clone(),
            ..Default::default()
        });
    trigger_ai_response(state, &task, &assistant, &team, &user, options, None, None).await?;

    Ok(serde_json::json!({
        "task_id": task.id,
        "subtask_id": assistant.id,
        "message_id": assistant.message_id,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// chat:resume / history:sync
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn on_chat_resume(
    state: &AppState,
    session: &Session,
    payload: ChatResumePayload,
) -> Result<Value> {
    require_access(state, payload.task_id, session.user_id).await?;
    state.rooms.join(&session.sid, &task_room(payload.task_id));

    let cached = state
        .sessions
        .get_streaming_content(payload.subtask_id)
        .await
        .unwrap_or(None)
        .unwrap_or_default();

    // Replay only the suffix the client is missing, to this socket
    // only. The offset is untrusted client input and may land inside a
    // multi-byte character; compute_delta clamps it to a boundary.
    if payload.offset < cached.len() {
        let (tail, _) = crate::ws::device::compute_delta(&cached, payload.offset);
        if !tail.is_empty() {
            let start = cached.len() - tail.len();
            let frame = Frame::new(
                tm_protocol::chat_events::CHUNK,
                serde_json::json!({
                    "task_id": payload.task_id,
                    "subtask_id": payload.subtask_id,
                    "content": tail,
                    "offset": start,
                }),
            );
            let _ = session.sink.send(frame).await;
        }
    }

    Ok(serde_json::json!({ "offset": cached.len() }))
}

async fn on_history_sync(
    state: &AppState,
    session: &Session,
    payload: HistorySyncPayload,
) -> Result<Value> {
    require_access(state, payload.task_id, session.user_id).await?;
    let subtasks = state
        .data
        .subtasks_after(payload.task_id, payload.after_message_id)
        .await?;
    Ok(serde_json::json!({ "subtasks": subtasks }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        BotRecord, DataService, GhostRecord, MemoryDataService, ShellRecord, TeamMember,
        TeamRecord, DEFAULT_NAMESPACE,
    };
    use crate::state::testing::test_state;
    use crate::ws::rooms::ConnectedSocket;
    use std::sync::Arc;

    fn seed_team(data: &Arc<MemoryDataService>) -> TeamRecord {
        data.add_user(UserRef {
            id: 1,
            name: "alice".into(),
            ..Default::default()
        });
        data.add_ghost(GhostRecord {
            id: 1,
            name: "scribe".into(),
            namespace: DEFAULT_NAMESPACE.into(),
            user_id: 0,
            system_prompt: Some("prompt".into()),
        });
        data.add_shell(ShellRecord {
            id: 1,
            name: "chat".into(),
            namespace: DEFAULT_NAMESPACE.into(),
            user_id: 0,
            shell_type: "Chat".into(),
            base_image: None,
        });
        data.add_bot(BotRecord {
            id: 1,
            name: "bot1".into(),
            namespace: DEFAULT_NAMESPACE.into(),
            user_id: 1,
            ghost_name: "scribe".into(),
            ghost_namespace: None,
            shell_name: "chat".into(),
            shell_namespace: None,
            agent_config: None,
            mcp_servers: None,
            skills: vec![],
        });
        let team = TeamRecord {
            id: 5,
            name: "crew".into(),
            namespace: DEFAULT_NAMESPACE.into(),
            user_id: 1,
            mode: None,
            members: vec![TeamMember {
                bot_id: 1,
                prompt: None,
                role: None,
            }],
        };
        data.add_team(team.clone());
        team
    }

    fn session(state: &AppState, sid: &str) -> (Session, tokio::sync::mpsc::Receiver<Frame>) {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        state.rooms.register(ConnectedSocket {
            sid: sid.into(),
            user_id: 1,
            user_name: "alice".into(),
            sink: tx.clone(),
        });
        (
            Session {
                sid: sid.into(),
                user_id: 1,
                user_name: "alice".into(),
                sink: tx,
            },
            rx,
        )
    }

    #[test]
    fn trigger_decision() {
        assert!(should_trigger_ai("hello", "crew", false));
        assert!(!should_trigger_ai("hello", "crew", true));
        assert!(should_trigger_ai("hey @crew, summarize", "crew", true));
        assert!(!should_trigger_ai("hey @crow", "crew", true));
    }

    #[tokio::test]
    async fn chat_send_creates_turns_and_acks_assistant_ids() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, _rx) = session(&state, "s1");

        let payload: ChatSendPayload = serde_json::from_value(serde_json::json!({
            "team_id": 5,
            "message": "hello",
        }))
        .unwrap();
        let reply = on_chat_send(&state, &session, payload).await.unwrap();

        let task_id = reply["task_id"].as_i64().unwrap();
        let assistant_id = reply["subtask_id"].as_i64().unwrap();
        assert_eq!(reply["message_id"], 2); // user turn is 1, assistant 2

        let assistant = data.get_subtask(assistant_id).await.unwrap().unwrap();
        assert_eq!(assistant.role, SubtaskRole::Assistant);
        assert_eq!(assistant.parent_id, Some(1));
        assert_eq!(assistant.task_id, task_id);
    }

    #[tokio::test]
    async fn group_chat_without_mention_skips_assistant() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, _rx) = session(&state, "s1");

        let payload: ChatSendPayload = serde_json::from_value(serde_json::json!({
            "team_id": 5,
            "message": "just chatting",
            "is_group_chat": true,
        }))
        .unwrap();
        let reply = on_chat_send(&state, &session, payload).await.unwrap();

        // Ack points at the user subtask; no assistant row exists.
        let task_id = reply["task_id"].as_i64().unwrap();
        assert_eq!(reply["message_id"], 1);
        assert!(data
            .latest_assistant_subtask(task_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn empty_message_rejected() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, _rx) = session(&state, "s1");
        let payload: ChatSendPayload = serde_json::from_value(serde_json::json!({
            "team_id": 5,
            "message": "   ",
        }))
        .unwrap();
        assert!(on_chat_send(&state, &session, payload).await.is_err());
    }

    #[tokio::test]
    async fn retry_reuses_subtask_identity() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, _rx) = session(&state, "s1");

        // First send; then force-fail the assistant.
        let payload: ChatSendPayload = serde_json::from_value(serde_json::json!({
            "team_id": 5,
            "message": "hello",
        }))
        .unwrap();
        let reply = on_chat_send(&state, &session, payload).await.unwrap();
        let task_id = reply["task_id"].as_i64().unwrap();
        let assistant_id = reply["subtask_id"].as_i64().unwrap();
        let message_id = reply["message_id"].as_i64().unwrap();

        data.update_subtask(
            assistant_id,
            SubtaskPatch::status(SubtaskStatus::Failed).with_error("boom"),
        )
        .await
        .unwrap();

        let retry: ChatRetryPayload = serde_json::from_value(serde_json::json!({
            "task_id": task_id,
            "subtask_id": assistant_id,
        }))
        .unwrap();
        let reply = on_chat_retry(&state, &session, retry).await.unwrap();

        // Same id, same message_id: no new subtask was created.
        assert_eq!(reply["subtask_id"], assistant_id);
        assert_eq!(reply["message_id"], message_id);
        let rows = data.subtasks_after(task_id, 0).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn cancel_preserves_partial_and_broadcasts() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, mut rx) = session(&state, "s1");

        let payload: ChatSendPayload = serde_json::from_value(serde_json::json!({
            "team_id": 5,
            "message": "hello",
        }))
        .unwrap();
        let reply = on_chat_send(&state, &session, payload).await.unwrap();
        let task_id = reply["task_id"].as_i64().unwrap();
        let assistant_id = reply["subtask_id"].as_i64().unwrap();
        state.rooms.join("s1", &task_room(task_id));

        let cancel: ChatCancelPayload = serde_json::from_value(serde_json::json!({
            "subtask_id": assistant_id,
            "partial_content": "he",
        }))
        .unwrap();
        on_chat_cancel(&state, &session, cancel).await.unwrap();

        let subtask = data.get_subtask(assistant_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Completed);
        assert_eq!(subtask.result_value(), "he");

        // chat:cancelled then chat:done then task:updated.
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(frame.event);
        }
        assert!(events.contains(&"chat:cancelled".to_string()));
        assert!(events.contains(&"chat:done".to_string()));
        assert!(events.contains(&"task:updated".to_string()));
    }

    #[tokio::test]
    async fn cancel_rejects_foreign_subtask() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, _rx) = session(&state, "s1");

        let task = data
            .create_task(2, None, None, serde_json::Map::new())
            .await
            .unwrap();
        let foreign = data
            .create_subtask(NewSubtask {
                task_id: task.id,
                role: SubtaskRole::Assistant,
                user_id: 2,
                prompt: None,
                parent_id: None,
                bot_ids: vec![],
                team_id: None,
                metadata: None,
            })
            .await
            .unwrap();

        let cancel: ChatCancelPayload = serde_json::from_value(serde_json::json!({
            "subtask_id": foreign.id,
        }))
        .unwrap();
        let err = on_chat_cancel(&state, &session, cancel).await.unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[tokio::test]
    async fn history_sync_returns_ascending_rows() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, _rx) = session(&state, "s1");

        let payload: ChatSendPayload = serde_json::from_value(serde_json::json!({
            "team_id": 5,
            "message": "one",
        }))
        .unwrap();
        let reply = on_chat_send(&state, &session, payload).await.unwrap();
        let task_id = reply["task_id"].as_i64().unwrap();

        let sync: HistorySyncPayload = serde_json::from_value(serde_json::json!({
            "task_id": task_id,
            "after_message_id": 0,
        }))
        .unwrap();
        let body = on_history_sync(&state, &session, sync).await.unwrap();
        let subtasks = body["subtasks"].as_array().unwrap();
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0]["message_id"], 1);
        assert_eq!(subtasks[1]["message_id"], 2);
    }

    #[tokio::test]
    async fn task_join_without_access_is_rejected() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, _rx) = session(&state, "s1");
        let foreign_task = data
            .create_task(2, None, None, serde_json::Map::new())
            .await
            .unwrap();

        let join: TaskJoinPayload = serde_json::from_value(serde_json::json!({
            "task_id": foreign_task.id,
        }))
        .unwrap();
        let err = on_task_join(&state, &session, join).await.unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
    }

    #[tokio::test]
    async fn task_join_reports_no_stream_when_idle() {
        let (state, data) = test_state();
        seed_team(&data);
        let (session, _rx) = session(&state, "s1");
        let task = data
            .create_task(1, None, None, serde_json::Map::new())
            .await
            .unwrap();

        let join: TaskJoinPayload =
            serde_json::from_value(serde_json::json!({ "task_id": task.id })).unwrap();
        let body = on_task_join(&state, &session, join).await.unwrap();
        assert!(body["streaming"].is_null());
    }
}
