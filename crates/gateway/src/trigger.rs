//! Unified AI trigger: the single path from "this turn should get an
//! assistant response" to a running dispatch.
//!
//! Builds the request, registers the stream (cancel token + task
//! streaming marker), then runs the dispatch as a background task so
//! the caller — a socket handler or the push consumer — acks quickly.

use std::sync::Arc;

use tm_domain::request::UserRef;
use tm_domain::task::TaskRecord;
use tm_domain::{Result, Subtask};

use crate::data::TeamRecord;
use crate::execution::emitters::ResultEmitter;
use crate::execution::BuildOptions;
use crate::state::AppState;

#[allow(clippy::too_many_arguments)]
pub async fn trigger_ai_response(
    state: &AppState,
    task: &TaskRecord,
    assistant: &Subtask,
    team: &TeamRecord,
    user: &UserRef,
    options: BuildOptions,
    device_id: Option<String>,
    emitter: Option<Arc<dyn ResultEmitter>>,
) -> Result<()> {
    tracing::info!(
        task_id = task.id,
        subtask_id = assistant.id,
        team_id = team.id,
        device_id = device_id.as_deref().unwrap_or(""),
        "triggering assistant response"
    );

    let request = state
        .builder
        .build(task, assistant, team, user, &options)
        .await?;

    if let Err(e) = state.cancels.register_stream(assistant.id).await {
        tracing::warn!(subtask_id = assistant.id, error = %e, "stream registration failed");
    }
    if let Err(e) = state
        .sessions
        .set_task_streaming(task.id, assistant.id, user.id, &user.name)
        .await
    {
        tracing::warn!(task_id = task.id, error = %e, "task streaming marker write failed");
    }

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        dispatcher
            .dispatch(request, emitter, device_id.as_deref())
            .await;
    });
    Ok(())
}
