//! Result emitters: uniform sinks for execution events.
//!
//! Every consumer of a stream — WebSocket rooms, SSE responses, HTTP
//! callbacks, subscription records — implements [`ResultEmitter`].
//! Emitters never raise to the producer: failures are logged and the
//! stream goes on. The dispatcher always installs
//! [`StatusUpdatingEmitter`] as the outermost wrapper so terminal
//! events reach durable state exactly once regardless of transport.

mod callback;
mod composite;
mod sse;
mod status;
mod subscription;
mod websocket;

pub use callback::{BatchCallbackEmitter, CallbackEmitter};
pub use composite::CompositeEmitter;
pub use sse::SseEmitter;
pub use status::StatusUpdatingEmitter;
pub use subscription::{StatusChangedHook, SubscriptionEmitter};
pub use websocket::WebSocketEmitter;

use async_trait::async_trait;
use serde_json::Value;

use tm_domain::ExecutionEvent;

/// Sink for execution events.
///
/// `emit` must tolerate events after a terminal (drop them) and `close`
/// must be idempotent.
#[async_trait]
pub trait ResultEmitter: Send + Sync {
    async fn emit(&self, event: ExecutionEvent);

    async fn close(&self) {}

    // ── Convenience constructors ────────────────────────────────────

    async fn emit_start(
        &self,
        task_id: i64,
        subtask_id: i64,
        message_id: Option<i64>,
        shell_type: &str,
    ) {
        self.emit(ExecutionEvent::start(task_id, subtask_id, message_id, shell_type))
            .await;
    }

    async fn emit_chunk(&self, task_id: i64, subtask_id: i64, content: &str, offset: i64) {
        self.emit(ExecutionEvent::chunk(task_id, subtask_id, content, offset))
            .await;
    }

    async fn emit_done(&self, task_id: i64, subtask_id: i64, result: Option<Value>) {
        self.emit(ExecutionEvent::done(task_id, subtask_id, result))
            .await;
    }

    async fn emit_error(&self, task_id: i64, subtask_id: i64, error: &str) {
        self.emit(ExecutionEvent::error(task_id, subtask_id, error))
            .await;
    }

    async fn emit_cancelled(&self, task_id: i64, subtask_id: i64) {
        self.emit(ExecutionEvent::cancelled(task_id, subtask_id))
            .await;
    }
}
