//! Inbound event sink for remote workers.
//!
//! Workers in http_callback mode POST each `ExecutionEvent` here (or
//! batches to `/batch`). Regular events flow through a status-updating
//! WebSocket emitter, so subscribers see them and terminals reach
//! durable state with registry cleanup. Validation and sandbox events
//! (recognised by `data.task_type`) are re-routed to dedicated handlers
//! that update their own store entries and never touch the subtask row.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::Value;

use tm_domain::ExecutionEvent;

use crate::execution::emitters::{ResultEmitter, StatusUpdatingEmitter, WebSocketEmitter};
use crate::state::AppState;

const VALIDATION_RESULT_TTL_SECS: u64 = 3600;

pub async fn handle_callback(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match process_event(&state, body).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok"})),
        ),
        Err(message) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"status": "error", "message": message})),
        ),
    }
}

pub async fn handle_batch_callback(
    State(state): State<AppState>,
    Json(bodies): Json<Vec<Value>>,
) -> impl IntoResponse {
    let total = bodies.len();
    let mut processed = 0usize;
    let mut errors: Vec<String> = Vec::new();

    for body in bodies {
        match process_event(&state, body).await {
            Ok(()) => processed += 1,
            Err(message) => {
                if errors.len() < 5 {
                    errors.push(message);
                }
            }
        }
    }
    tracing::info!(processed, total, "callback batch processed");

    let status = if errors.is_empty() { "ok" } else { "partial" };
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": status,
            "message": format!("processed {processed}/{total} events"),
            "errors": errors,
        })),
    )
}

async fn process_event(state: &AppState, body: Value) -> Result<(), String> {
    let event: ExecutionEvent =
        serde_json::from_value(body).map_err(|e| format!("invalid event payload: {e}"))?;

    tracing::info!(
        event_type = event.event_type.as_str(),
        task_id = event.task_id,
        subtask_id = event.subtask_id,
        "callback event received"
    );

    // Worker activity implies liveness.
    if !event.is_terminal() {
        let _ = state.heartbeats.update(event.task_id).await;
    }

    match event.task_type() {
        Some("validation") => handle_validation_event(state, &event).await,
        Some("sandbox") => handle_sandbox_event(state, &event).await,
        _ => handle_regular_event(state, event).await,
    }
    Ok(())
}

async fn handle_regular_event(state: &AppState, event: ExecutionEvent) {
    let ws_emitter: Arc<dyn ResultEmitter> = Arc::new(WebSocketEmitter::new(
        state.ws.clone(),
        state.data.clone(),
        event.task_id,
        event.subtask_id,
        None,
    ));
    let emitter = StatusUpdatingEmitter::new(
        ws_emitter,
        state.data.clone(),
        event.task_id,
        event.subtask_id,
    )
    .with_stream_services(state.stream_services());

    emitter.emit(event).await;
    emitter.close().await;
}

/// Validation workers probe image compatibility; their events land in a
/// short-lived store entry read by the validation API, not in any
/// subtask row (validation tasks have none).
async fn handle_validation_event(state: &AppState, event: &ExecutionEvent) {
    let key = format!("validation:result:{}", event.task_id);
    let record = serde_json::json!({
        "type": event.event_type.as_str(),
        "task_id": event.task_id,
        "progress": event.progress,
        "status": event.status,
        "result": event.result,
        "error": event.error,
    });
    if let Err(e) = state
        .store
        .set_json(&key, &record, Some(VALIDATION_RESULT_TTL_SECS))
        .await
    {
        tracing::error!(task_id = event.task_id, error = %e, "validation result write failed");
    }
}

/// Sandbox workers are long-lived; their lifecycle events feed the
/// sandbox store entry only.
async fn handle_sandbox_event(state: &AppState, event: &ExecutionEvent) {
    let key = format!("sandbox:event:{}", event.task_id);
    let record = serde_json::json!({
        "type": event.event_type.as_str(),
        "task_id": event.task_id,
        "status": event.status,
        "error": event.error,
    });
    if let Err(e) = state
        .store
        .set_json(&key, &record, Some(VALIDATION_RESULT_TTL_SECS))
        .await
    {
        tracing::error!(task_id = event.task_id, error = %e, "sandbox event write failed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
