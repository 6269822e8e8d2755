//! Session cache: chat history, the streaming replay cache, the live
//! stream pub/sub channel, and the task-level streaming marker.
//!
//! Key families:
//! - `chat:history:{task_id}` — `[{role, content}]`, tail-truncated
//! - `chat:streaming:{subtask_id}` — accumulated text, short TTL
//! - `chat:stream_channel:{subtask_id}` — pub/sub per-chunk push
//! - `chat:task_streaming:{task_id}` — who owns the live stream

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tm_domain::config::CacheConfig;
use tm_domain::Result;

use crate::store::StateStore;

/// Control message published on the stream channel when a stream ends.
pub const STREAM_DONE_MARKER: &str = "STREAM_DONE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Recorded owner of a task's live stream (group chats need to know
/// which member triggered the running turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStreamingMarker {
    pub subtask_id: i64,
    pub user_id: i64,
    pub username: String,
    pub started_at: String,
}

#[derive(Clone)]
pub struct SessionCache {
    store: StateStore,
    config: CacheConfig,
}

fn history_key(task_id: i64) -> String {
    format!("chat:history:{task_id}")
}

fn streaming_key(subtask_id: i64) -> String {
    format!("chat:streaming:{subtask_id}")
}

fn channel_key(subtask_id: i64) -> String {
    format!("chat:stream_channel:{subtask_id}")
}

fn task_streaming_key(task_id: i64) -> String {
    format!("chat:task_streaming:{task_id}")
}

/// Keep only the newest `max` messages.
fn truncate_history(mut messages: Vec<HistoryMessage>, max: usize) -> Vec<HistoryMessage> {
    if messages.len() > max {
        messages.drain(..messages.len() - max);
    }
    messages
}

impl SessionCache {
    pub fn new(store: StateStore, config: CacheConfig) -> Self {
        Self { store, config }
    }

    // ── Chat history ────────────────────────────────────────────────

    pub async fn get_history(&self, task_id: i64) -> Result<Vec<HistoryMessage>> {
        Ok(self
            .store
            .get_json(&history_key(task_id))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_history(&self, task_id: i64, messages: Vec<HistoryMessage>) -> Result<()> {
        let messages = truncate_history(messages, self.config.history_max_messages);
        self.store
            .set_json(
                &history_key(task_id),
                &messages,
                Some(self.config.history_ttl_secs),
            )
            .await
    }

    pub async fn append_message(&self, task_id: i64, role: &str, content: &str) -> Result<()> {
        let mut history = self.get_history(task_id).await?;
        history.push(HistoryMessage {
            role: role.into(),
            content: content.into(),
        });
        self.save_history(task_id, history).await
    }

    /// The common post-completion pattern: append the user turn and the
    /// assistant answer together.
    pub async fn append_exchange(
        &self,
        task_id: i64,
        user_message: &str,
        assistant_message: &str,
    ) -> Result<()> {
        let mut history = self.get_history(task_id).await?;
        history.push(HistoryMessage {
            role: "user".into(),
            content: user_message.into(),
        });
        history.push(HistoryMessage {
            role: "assistant".into(),
            content: assistant_message.into(),
        });
        self.save_history(task_id, history).await
    }

    pub async fn clear_history(&self, task_id: i64) -> Result<()> {
        self.store.delete(&history_key(task_id)).await?;
        Ok(())
    }

    // ── Streaming replay cache ──────────────────────────────────────

    pub async fn save_streaming_content(&self, subtask_id: i64, content: &str) -> Result<()> {
        self.store
            .set_string(
                &streaming_key(subtask_id),
                content,
                Some(self.config.streaming_ttl_secs),
            )
            .await
    }

    pub async fn get_streaming_content(&self, subtask_id: i64) -> Result<Option<String>> {
        self.store.get_string(&streaming_key(subtask_id)).await
    }

    /// Called on any terminal event; the replay cache only matters while
    /// a stream is live.
    pub async fn delete_streaming_content(&self, subtask_id: i64) -> Result<()> {
        self.store.delete(&streaming_key(subtask_id)).await?;
        Ok(())
    }

    // ── Live stream channel ─────────────────────────────────────────

    pub async fn publish_chunk(&self, subtask_id: i64, chunk: &str) -> Result<()> {
        self.store.publish(&channel_key(subtask_id), chunk).await
    }

    pub async fn publish_done(&self, subtask_id: i64, result: Option<&Value>) -> Result<()> {
        let message = serde_json::json!({ "__type__": STREAM_DONE_MARKER, "result": result });
        self.store
            .publish(&channel_key(subtask_id), &message.to_string())
            .await
    }

    pub async fn subscribe_stream(&self, subtask_id: i64) -> Result<redis::aio::PubSub> {
        self.store.subscribe(&channel_key(subtask_id)).await
    }

    /// True if a channel payload is the end-of-stream control message.
    pub fn is_stream_done(payload: &str) -> bool {
        serde_json::from_str::<Value>(payload)
            .ok()
            .and_then(|v| {
                v.get("__type__")
                    .and_then(Value::as_str)
                    .map(|t| t == STREAM_DONE_MARKER)
            })
            .unwrap_or(false)
    }

    // ── Task-level streaming marker ─────────────────────────────────

    pub async fn set_task_streaming(
        &self,
        task_id: i64,
        subtask_id: i64,
        user_id: i64,
        username: &str,
    ) -> Result<()> {
        let marker = TaskStreamingMarker {
            subtask_id,
            user_id,
            username: username.into(),
            started_at: Utc::now().to_rfc3339(),
        };
        self.store
            .set_json(
                &task_streaming_key(task_id),
                &marker,
                Some(self.config.task_streaming_ttl_secs),
            )
            .await
    }

    pub async fn get_task_streaming(&self, task_id: i64) -> Result<Option<TaskStreamingMarker>> {
        self.store.get_json(&task_streaming_key(task_id)).await
    }

    pub async fn clear_task_streaming(&self, task_id: i64) -> Result<()> {
        self.store.delete(&task_streaming_key(task_id)).await?;
        Ok(())
    }
}
