//! Internal task API: status writes from the executor manager and the
//! heartbeat scanner, pull-mode task fetching, and worker heartbeats.
//!
//! The same failure path backs [`LocalStatusSink`], handed to embedded
//! worker-side components so an in-process manager needs no HTTP hop.

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::Value;

use tm_domain::task::{SubtaskPatch, SubtaskStatus};
use tm_domain::Result;
use tm_executor::TaskStatusSink;

use crate::push;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /internal/tasks/status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct TaskStatusRequest {
    pub task_id: i64,
    pub subtask_id: i64,
    pub status: SubtaskStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub executor_name: Option<String>,
}

pub async fn handle_task_status(
    State(state): State<AppState>,
    Json(body): Json<TaskStatusRequest>,
) -> impl IntoResponse {
    let outcome = apply_status_update(
        &state,
        body.task_id,
        body.subtask_id,
        body.status,
        body.progress,
        body.result,
        body.error_message.as_deref(),
        body.executor_name.as_deref(),
    )
    .await;

    match outcome {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"status": "error", "message": e.to_string()})),
        ),
    }
}

/// Write a status update and fan the user-visible consequences out:
/// FAILED produces `chat:error` + `chat:done` in the task room and
/// `task:status` in the owner's room, plus registry/heartbeat cleanup.
#[allow(clippy::too_many_arguments)]
pub async fn apply_status_update(
    state: &AppState,
    task_id: i64,
    subtask_id: i64,
    status: SubtaskStatus,
    progress: Option<u8>,
    result: Option<Value>,
    error_message: Option<&str>,
    executor_name: Option<&str>,
) -> Result<()> {
    let mut patch = SubtaskPatch::status(status);
    patch.progress = progress;
    patch.result = result;
    patch.error_message = error_message.map(String::from);
    patch.executor_name = executor_name.map(String::from);
    let updated = state.data.update_subtask(subtask_id, patch).await?;

    if status == SubtaskStatus::Failed {
        let message = error_message.unwrap_or("Task failed");
        state
            .ws
            .emit_chat_error(task_id, subtask_id, message, Some(updated.message_id))
            .await;
        state
            .ws
            .emit_chat_done(task_id, subtask_id, 0, None, Some(updated.message_id))
            .await;
        state
            .ws
            .emit_task_status(updated.user_id, task_id, "FAILED", progress)
            .await;
    }

    if status.is_terminal() {
        let _ = state.heartbeats.delete(task_id).await;
        if let Err(e) = state.tracker.remove(task_id).await {
            tracing::debug!(task_id, error = %e, "registry removal failed");
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /internal/tasks/pending
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_task_type() -> String {
    "online".into()
}

fn default_limit() -> usize {
    10
}

pub async fn handle_pending_tasks(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> impl IntoResponse {
    match push::collect_pending(&state, &query.task_type, query.limit).await {
        Ok(tasks) => (
            StatusCode::OK,
            Json(serde_json::json!({ "tasks": tasks })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"tasks": [], "error": e.to_string()})),
        ),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /internal/heartbeat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub task_id: i64,
}

pub async fn handle_heartbeat(
    State(state): State<AppState>,
    Json(body): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match state.heartbeats.update(body.task_id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"status": "error", "message": e.to_string()})),
        ),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process status sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `TaskStatusSink` for embedded worker-side components (queue
/// consumer, heartbeat scanner): same semantics as the HTTP endpoint,
/// without the HTTP.
pub struct LocalStatusSink {
    state: AppState,
}

impl LocalStatusSink {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl TaskStatusSink for LocalStatusSink {
    async fn mark_task_failed(
        &self,
        task_id: i64,
        subtask_id: i64,
        error_message: &str,
        executor_name: Option<&str>,
    ) -> Result<()> {
        apply_status_update(
            &self.state,
            task_id,
            subtask_id,
            SubtaskStatus::Failed,
            Some(0),
            Some(serde_json::json!({ "value": error_message })),
            Some(error_message),
            executor_name,
        )
        .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataService, NewSubtask};
    use crate::state::testing::test_state;
    use crate::ws::rooms::ConnectedSocket;
    use tm_domain::task::SubtaskRole;
    use tm_protocol::Frame;
    use tokio::sync::mpsc;

    async fn seed_running(state: &AppState) -> (i64, i64) {
        let task = state
            .data
            .create_task(1, None, None, serde_json::Map::new())
            .await
            .unwrap();
        let subtask = state
            .data
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
        state
            .data
            .update_subtask(subtask.id, SubtaskPatch::status(SubtaskStatus::Running))
            .await
            .unwrap();
        (task.id, subtask.id)
    }

    #[tokio::test]
    async fn failed_update_notifies_rooms() {
        let (state, data) = test_state();
        let (task_id, subtask_id) = seed_running(&state).await;

        // A subscriber in both rooms.
        let (tx, mut rx) = mpsc::channel::<Frame>(32);
        state.rooms.register(ConnectedSocket {
            sid: "s1".into(),
            user_id: 1,
            user_name: "alice".into(),
            sink: tx,
        });
        state.rooms.join("s1", &tm_protocol::task_room(task_id));
        state.rooms.join("s1", &tm_protocol::user_room(1));

        let sink = LocalStatusSink::new(state.clone());
        sink.mark_task_failed(task_id, subtask_id, "Task failed after 3 retries: boom", None)
            .await
            .unwrap();

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Failed);
        assert!(subtask
            .error_message
            .as_deref()
            .unwrap()
            .contains("3 retries"));

        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(frame.event);
        }
        assert!(events.contains(&"chat:error".to_string()));
        assert!(events.contains(&"chat:done".to_string()));
        assert!(events.contains(&"task:status".to_string()));
    }
}
