//! Executor-manager service and HTTP API.
//!
//! The dispatcher's http_callback transport POSTs a wrapper object to
//! `/v1/execute`; depending on the dispatch mode the manager either
//! enqueues it (push) or starts the container directly (pull/direct).
//! `/v1/cancel` forwards cancellation to the owning container.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use tm_domain::config::DispatchMode;
use tm_domain::{ExecutionRequest, Result};
use tm_state::{QueueType, RunningTaskTracker, TaskQueue};

use crate::docker::{DockerExecutor, SubmitOutcome};

/// Constant-time token comparison via SHA-256 digest. Hashing
/// normalizes lengths so ct_eq always compares 32 bytes.
pub fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Docker executor plus the running-task registry: every successful
/// submission is registered so the heartbeat scanner can watch it.
pub struct ExecutorService {
    executor: Arc<DockerExecutor>,
    tracker: RunningTaskTracker,
}

impl ExecutorService {
    pub fn new(executor: Arc<DockerExecutor>, tracker: RunningTaskTracker) -> Self {
        Self { executor, tracker }
    }

    pub fn executor(&self) -> &DockerExecutor {
        &self.executor
    }

    pub fn tracker(&self) -> &RunningTaskTracker {
        &self.tracker
    }

    pub async fn submit_and_register(&self, request: &ExecutionRequest) -> Result<SubmitOutcome> {
        let outcome = self.executor.submit(request).await?;
        if let Err(e) = self
            .tracker
            .add(
                request.task_id,
                request.subtask_id,
                &outcome.executor_name,
                request.task_type(),
            )
            .await
        {
            // The worker is already running; a registry miss only costs
            // crash detection for this task.
            tracing::error!(
                task_id = request.task_id,
                error = %e,
                "failed to register running task"
            );
        }
        Ok(outcome)
    }

    pub async fn cancel(&self, task_id: i64) -> Result<()> {
        self.executor.cancel_task(task_id).await?;
        self.tracker.remove(task_id).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP API
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct ManagerState {
    pub service: Arc<ExecutorService>,
    pub dispatch_mode: DispatchMode,
    pub online_queue: TaskQueue,
    pub offline_queue: TaskQueue,
    pub internal_token: String,
}

/// Wrapper body the dispatcher POSTs in http_callback mode.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: i64,
    pub subtask_id: i64,
    #[serde(default)]
    pub executor_name: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
    pub payload: ExecutionRequest,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub task_id: i64,
    #[serde(default)]
    pub subtask_id: Option<i64>,
}

pub fn manager_router(state: ManagerState) -> Router {
    Router::new()
        .route("/v1/execute", post(execute))
        .route("/v1/cancel", post(cancel))
        .with_state(state)
}

fn authorized(state: &ManagerState, headers: &HeaderMap) -> bool {
    if state.internal_token.is_empty() {
        return true;
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token_eq(token, &state.internal_token))
        .unwrap_or(false)
}

async fn execute(
    State(state): State<ManagerState>,
    headers: HeaderMap,
    Json(body): Json<ExecuteRequest>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"status": "unauthorized"})),
        );
    }

    let mut request = body.payload;
    request.task_id = body.task_id;
    request.subtask_id = body.subtask_id;
    if request.executor_name.is_none() {
        request.executor_name = body.executor_name;
    }

    tracing::info!(
        task_id = request.task_id,
        subtask_id = request.subtask_id,
        shell_type = body.shell_type.as_deref().unwrap_or(""),
        mode = ?state.dispatch_mode,
        "execute request accepted"
    );

    match state.dispatch_mode {
        DispatchMode::Push => {
            let queue = match QueueType::for_task_type(request.task_type()) {
                QueueType::Online => &state.online_queue,
                QueueType::Offline => &state.offline_queue,
            };
            match queue.enqueue(&request).await {
                Ok(()) => (
                    StatusCode::OK,
                    Json(serde_json::json!({"status": "queued"})),
                ),
                Err(e) => {
                    tracing::error!(task_id = request.task_id, error = %e, "enqueue failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({"status": "failed", "error_msg": e.to_string()})),
                    )
                }
            }
        }
        DispatchMode::Pull => match state.service.submit_and_register(&request).await {
            Ok(outcome) => (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "success",
                    "executor_name": outcome.executor_name,
                })),
            ),
            Err(e) => {
                tracing::error!(task_id = request.task_id, error = %e, "direct submit failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"status": "failed", "error_msg": e.to_string()})),
                )
            }
        },
    }
}

async fn cancel(
    State(state): State<ManagerState>,
    headers: HeaderMap,
    Json(body): Json<CancelRequest>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"status": "unauthorized"})),
        );
    }

    tracing::info!(task_id = body.task_id, "cancel request accepted");
    match state.service.cancel(body.task_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "success"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"status": "failed", "error_msg": e.to_string()})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_eq_basic() {
        assert!(token_eq("secret", "secret"));
        assert!(!token_eq("secret", "Secret"));
        assert!(!token_eq("secret", ""));
        // Length mismatch still compares safely.
        assert!(!token_eq("short", "a much longer token value"));
    }
}
