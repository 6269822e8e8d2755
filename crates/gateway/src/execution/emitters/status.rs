//! The mandatory status-updating wrapper.
//!
//! Installed by the dispatcher (and the callback endpoint) around any
//! caller-provided emitter. Terminal events write durable state exactly
//! once per wrapper lifetime:
//! - DONE → subtask COMPLETED with `{value: accumulated}` merged in
//! - ERROR → subtask FAILED with the message
//! - CANCELLED → subtask COMPLETED with the partial text preserved;
//!   the wire still carries `chat:cancelled` (the partial answer stays
//!   visible while clients render the cancel)
//!
//! Terminal cleanup also happens here: replay cache deleted, stream
//! channel closed, cancel flag unregistered, running-task registry
//! entry removed, history appended on success.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use tm_domain::event::merge_result_value;
use tm_domain::task::{SubtaskPatch, SubtaskStatus};
use tm_domain::{EventType, ExecutionEvent, ResultView};

use crate::data::DataService;
use crate::execution::StreamServices;

use super::ResultEmitter;

pub struct StatusUpdatingEmitter {
    inner: Arc<dyn ResultEmitter>,
    data: Arc<dyn DataService>,
    services: Option<StreamServices>,
    task_id: i64,
    subtask_id: i64,
    /// User prompt paired with the answer in the history cache.
    user_prompt: Option<String>,
    accumulated: Mutex<String>,
    status_updated: AtomicBool,
}

impl StatusUpdatingEmitter {
    pub fn new(
        inner: Arc<dyn ResultEmitter>,
        data: Arc<dyn DataService>,
        task_id: i64,
        subtask_id: i64,
    ) -> Self {
        Self {
            inner,
            data,
            services: None,
            task_id,
            subtask_id,
            user_prompt: None,
            accumulated: Mutex::new(String::new()),
            status_updated: AtomicBool::new(false),
        }
    }

    pub fn with_stream_services(mut self, services: StreamServices) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_user_prompt(mut self, prompt: Option<String>) -> Self {
        self.user_prompt = prompt;
        self
    }

    /// First terminal wins; the DB transition fires at most once even
    /// when the wrapped emitter loops events back through this wrapper.
    fn begin_terminal(&self) -> bool {
        !self.status_updated.swap(true, Ordering::AcqRel)
    }

    async fn write_subtask(&self, patch: SubtaskPatch) {
        if let Err(e) = self.data.update_subtask(self.subtask_id, patch).await {
            tracing::error!(
                task_id = self.task_id,
                subtask_id = self.subtask_id,
                error = %e,
                "failed to write terminal subtask status"
            );
        }
    }

    async fn on_chunk(&self, event: &ExecutionEvent) {
        let snapshot = {
            let mut accumulated = self.accumulated.lock();
            accumulated.push_str(&event.content);
            accumulated.clone()
        };
        if let Some(services) = &self.services {
            if let Err(e) = services
                .sessions
                .save_streaming_content(self.subtask_id, &snapshot)
                .await
            {
                tracing::warn!(subtask_id = self.subtask_id, error = %e, "replay cache write failed");
            }
            if !event.content.is_empty() {
                let _ = services
                    .sessions
                    .publish_chunk(self.subtask_id, &event.content)
                    .await;
            }
        }
    }

    async fn on_done(&self, event: &ExecutionEvent) {
        if !self.begin_terminal() {
            return;
        }
        let accumulated = self.accumulated.lock().clone();
        let result = merge_result_value(event.result.clone(), &accumulated);
        let value = ResultView(&result).value().to_owned();

        self.write_subtask(
            SubtaskPatch::status(SubtaskStatus::Completed).with_result(result.clone()),
        )
        .await;
        tracing::info!(
            task_id = self.task_id,
            subtask_id = self.subtask_id,
            "subtask completed"
        );

        if let Some(services) = &self.services {
            if let Some(prompt) = &self.user_prompt {
                let _ = services
                    .sessions
                    .append_exchange(self.task_id, prompt, &value)
                    .await;
            } else {
                let _ = services
                    .sessions
                    .append_message(self.task_id, "assistant", &value)
                    .await;
            }
        }
        self.cleanup(Some(&result)).await;
    }

    async fn on_error(&self, event: &ExecutionEvent) {
        if !self.begin_terminal() {
            return;
        }
        let message = event.error.clone().unwrap_or_else(|| "Unknown error".into());
        self.write_subtask(SubtaskPatch::status(SubtaskStatus::Failed).with_error(&message))
            .await;
        tracing::info!(
            task_id = self.task_id,
            subtask_id = self.subtask_id,
            error = %message,
            "subtask failed"
        );
        self.cleanup(None).await;
    }

    async fn on_cancelled(&self) {
        if !self.begin_terminal() {
            return;
        }
        let accumulated = self.accumulated.lock().clone();
        // COMPLETED, not CANCELLED: the partial response stays visible.
        let mut patch = SubtaskPatch::status(SubtaskStatus::Completed);
        if !accumulated.is_empty() {
            patch = patch.with_result(serde_json::json!({ "value": accumulated }));
        }
        self.write_subtask(patch).await;
        tracing::info!(
            task_id = self.task_id,
            subtask_id = self.subtask_id,
            "subtask completed with partial response after cancel"
        );
        self.cleanup(None).await;
    }

    async fn cleanup(&self, result: Option<&Value>) {
        let Some(services) = &self.services else {
            return;
        };
        let _ = services
            .sessions
            .delete_streaming_content(self.subtask_id)
            .await;
        let _ = services.sessions.publish_done(self.subtask_id, result).await;
        let _ = services.sessions.clear_task_streaming(self.task_id).await;
        services.cancels.unregister_stream(self.subtask_id).await;
        if let Err(e) = services.tracker.remove(self.task_id).await {
            tracing::debug!(task_id = self.task_id, error = %e, "registry entry removal failed");
        }
    }
}

#[async_trait]
impl ResultEmitter for StatusUpdatingEmitter {
    async fn emit(&self, event: ExecutionEvent) {
        match event.event_type {
            EventType::Chunk => self.on_chunk(&event).await,
            EventType::Done => self.on_done(&event).await,
            EventType::Error => self.on_error(&event).await,
            EventType::Cancelled => self.on_cancelled().await,
            _ => {}
        }

        // Forward everything unchanged, terminal or not.
        self.inner.emit(event).await;
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryDataService, NewSubtask};
    use tm_domain::task::SubtaskRole;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResultEmitter for Recorder {
        async fn emit(&self, event: ExecutionEvent) {
            self.seen.lock().push(event.event_type.as_str().to_owned());
        }
    }

    async fn setup() -> (Arc<MemoryDataService>, Arc<Recorder>, StatusUpdatingEmitter, i64, i64) {
        let data = Arc::new(MemoryDataService::new());
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
        let inner = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
        });
        let emitter =
            StatusUpdatingEmitter::new(inner.clone(), data.clone(), task.id, subtask.id);
        (data, inner, emitter, task.id, subtask.id)
    }

    #[tokio::test]
    async fn done_merges_accumulated_content() {
        let (data, inner, emitter, task_id, subtask_id) = setup().await;
        emitter.emit_chunk(task_id, subtask_id, "he", 0).await;
        emitter.emit_chunk(task_id, subtask_id, "llo", 2).await;
        emitter
            .emit_done(task_id, subtask_id, Some(serde_json::json!({"thinking": "t"})))
            .await;

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Completed);
        assert_eq!(subtask.result_value(), "hello");

        let task = data.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, Some(SubtaskStatus::Completed));
        assert_eq!(task.progress, 100);

        // All events forwarded unchanged.
        assert_eq!(inner.seen.lock().as_slice(), &["chunk", "chunk", "done"]);
    }

    #[tokio::test]
    async fn error_marks_failed() {
        let (data, _, emitter, task_id, subtask_id) = setup().await;
        emitter.emit_error(task_id, subtask_id, "image pull failed").await;

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Failed);
        assert_eq!(subtask.error_message.as_deref(), Some("image pull failed"));

        let task = data.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, Some(SubtaskStatus::Failed));
        assert_eq!(task.error_message.as_deref(), Some("image pull failed"));
    }

    #[tokio::test]
    async fn cancel_preserves_partial_as_completed() {
        let (data, inner, emitter, task_id, subtask_id) = setup().await;
        emitter.emit_chunk(task_id, subtask_id, "he", 0).await;
        emitter.emit_cancelled(task_id, subtask_id).await;

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Completed);
        assert_eq!(subtask.result_value(), "he");
        // The cancelled wire event still reaches subscribers.
        assert!(inner.seen.lock().contains(&"cancelled".to_string()));
    }

    #[tokio::test]
    async fn terminal_transition_fires_once() {
        let (data, inner, emitter, task_id, subtask_id) = setup().await;
        emitter
            .emit_done(task_id, subtask_id, Some(serde_json::json!({"value": "first"})))
            .await;
        emitter
            .emit_done(task_id, subtask_id, Some(serde_json::json!({"value": "second"})))
            .await;
        emitter.emit_error(task_id, subtask_id, "late error").await;

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Completed);
        assert_eq!(subtask.result_value(), "first");
        assert!(subtask.error_message.is_none());

        // Forwarding is not gated: subscribers still see the later events.
        assert_eq!(inner.seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn done_without_result_uses_accumulated() {
        let (data, _, emitter, task_id, subtask_id) = setup().await;
        emitter.emit_chunk(task_id, subtask_id, "only", 0).await;
        emitter.emit_done(task_id, subtask_id, None).await;

        let subtask = data.get_subtask(subtask_id).await.unwrap().unwrap();
        assert_eq!(subtask.result_value(), "only");
    }
}
