//! Push-mode dispatch: PENDING assistant subtasks become queued
//! `ExecutionRequest`s.
//!
//! The loop scans for pending turns, builds full requests, enqueues
//! them by task type, and claims each row (PENDING → RUNNING) so the
//! next scan does not re-dispatch it. The same `collect_pending` backs
//! the pull-mode fetch endpoint.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tm_domain::request::UserRef;
use tm_domain::task::{SubtaskPatch, SubtaskStatus};
use tm_domain::{ExecutionRequest, Result, Subtask};
use tm_state::QueueType;

use crate::execution::BuildOptions;
use crate::state::AppState;

/// Build dispatchable requests for up to `limit` pending assistant
/// subtasks, claiming each one. A turn whose graph fails to resolve is
/// failed in place rather than silently retried forever.
pub async fn collect_pending(
    state: &AppState,
    task_type: &str,
    limit: usize,
) -> Result<Vec<ExecutionRequest>> {
    let pending = state
        .data
        .list_pending_assistant_subtasks(task_type, limit)
        .await?;

    let mut requests = Vec::with_capacity(pending.len());
    for subtask in pending {
        match build_request(state, &subtask).await {
            Ok(request) => {
                // Claim: the dispatcher would set RUNNING anyway; doing
                // it at fetch time keeps rescans from double-dispatch.
                state
                    .data
                    .update_subtask(subtask.id, SubtaskPatch::status(SubtaskStatus::Running))
                    .await?;
                requests.push(request);
            }
            Err(e) => {
                tracing::error!(
                    subtask_id = subtask.id,
                    error = %e,
                    "pending turn cannot be built, failing it"
                );
                let _ = state
                    .data
                    .update_subtask(
                        subtask.id,
                        SubtaskPatch::status(SubtaskStatus::Failed)
                            .with_error(format!("dispatch preparation failed: {e}")),
                    )
                    .await;
            }
        }
    }
    Ok(requests)
}

async fn build_request(state: &AppState, subtask: &Subtask) -> Result<ExecutionRequest> {
    let task = state
        .data
        .get_task(subtask.task_id)
        .await?
        .ok_or_else(|| tm_domain::Error::NotFound(format!("task {}", subtask.task_id)))?;
    let team_id = subtask
        .team_id
        .or(task.team_id)
        .ok_or_else(|| tm_domain::Error::Validation("turn has no team".into()))?;
    let team = state
        .data
        .get_team(team_id)
        .await?
        .ok_or_else(|| tm_domain::Error::NotFound(format!("team {team_id}")))?;
    let user = state
        .data
        .get_user(subtask.user_id)
        .await?
        .unwrap_or(UserRef {
            id: subtask.user_id,
            ..Default::default()
        });

    let message = match subtask.parent_id {
        Some(parent) => state
            .data
            .find_user_subtask_by_message(subtask.task_id, parent)
            .await?
            .and_then(|u| u.prompt)
            .unwrap_or_default(),
        None => String::new(),
    };

    state
        .builder
        .build(&task, subtask, &team, &user, &BuildOptions::for_message(&message))
        .await
}

/// Background loop for push mode: scan, build, enqueue.
pub async fn run_push_dispatcher(state: AppState, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.config.queue.task_fetch_interval_secs,
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!("push dispatcher started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        for task_type in ["online", "offline"] {
            let batch = match collect_pending(&state, task_type, 10).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(task_type, error = %e, "pending scan failed");
                    continue;
                }
            };
            for request in batch {
                let queue = match QueueType::for_task_type(request.task_type()) {
                    QueueType::Online => &state.online_queue,
                    QueueType::Offline => &state.offline_queue,
                };
                if let Err(e) = queue.enqueue(&request).await {
                    tracing::error!(
                        task_id = request.task_id,
                        subtask_id = request.subtask_id,
                        error = %e,
                        "enqueue failed"
                    );
                }
            }
        }
    }
    tracing::info!("push dispatcher stopped");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
