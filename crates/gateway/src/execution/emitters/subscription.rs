//! Subscription emitter: records the outcome of background
//! (subscription) executions.
//!
//! Chunk text accumulates silently; the terminal event updates the
//! BackgroundExecution row. A done whose result carries `silent_exit`
//! (on the event or on the persisted subtask) completes as
//! COMPLETED_SILENT — the agent decided there was nothing worth
//! notifying about.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use tm_domain::{EventType, ExecutionEvent, ResultView};

use crate::data::DataService;

use super::ResultEmitter;

const SUMMARY_MAX_CHARS: usize = 500;

/// Hook invoked after each status write: (status, summary, is_silent).
pub type StatusChangedHook = Arc<
    dyn Fn(String, String, bool) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

pub struct SubscriptionEmitter {
    task_id: i64,
    subtask_id: i64,
    execution_id: i64,
    data: Arc<dyn DataService>,
    on_status_changed: Option<StatusChangedHook>,
    accumulated: Mutex<String>,
    closed: AtomicBool,
}

/// Summary for the execution row: the result value, else the
/// accumulated stream text, ellipsised at the cap.
pub fn summarize(result_value: &str, accumulated: &str) -> String {
    let source = if result_value.is_empty() {
        accumulated
    } else {
        result_value
    };
    let mut summary: String = source.chars().take(SUMMARY_MAX_CHARS).collect();
    if source.chars().count() > SUMMARY_MAX_CHARS {
        summary.push_str("...");
    }
    summary
}

impl SubscriptionEmitter {
    pub fn new(
        task_id: i64,
        subtask_id: i64,
        execution_id: i64,
        data: Arc<dyn DataService>,
        on_status_changed: Option<StatusChangedHook>,
    ) -> Self {
        Self {
            task_id,
            subtask_id,
            execution_id,
            data,
            on_status_changed,
            accumulated: Mutex::new(String::new()),
            closed: AtomicBool::new(false),
        }
    }

    async fn update_execution(&self, status: &str, summary: Option<&str>, error: Option<&str>) {
        if let Err(e) = self
            .data
            .update_background_execution(self.execution_id, status, summary, error)
            .await
        {
            tracing::error!(
                execution_id = self.execution_id,
                status,
                error = %e,
                "failed to update background execution"
            );
        } else {
            tracing::info!(
                execution_id = self.execution_id,
                task_id = self.task_id,
                status,
                "background execution updated"
            );
        }
    }

    async fn notify(&self, status: &str, summary: &str, is_silent: bool) {
        if let Some(hook) = &self.on_status_changed {
            hook(status.to_owned(), summary.to_owned(), is_silent).await;
        }
    }

    async fn subtask_silent_exit(&self) -> bool {
        match self.data.get_subtask(self.subtask_id).await {
            Ok(Some(subtask)) => subtask
                .result_view()
                .map(|v| v.silent_exit())
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn handle_done(&self, event: &ExecutionEvent) {
        let mut is_silent = event
            .result_view()
            .map(|v| v.silent_exit())
            .unwrap_or(false);
        // The worker may have written the flag straight to the subtask
        // without carrying it on the event.
        if !is_silent {
            is_silent = self.subtask_silent_exit().await;
        }

        let status = if is_silent { "COMPLETED_SILENT" } else { "COMPLETED" };
        let result_value = event
            .result_view()
            .map(|v| v.value().to_owned())
            .unwrap_or_default();
        let summary = summarize(&result_value, &self.accumulated.lock());

        self.update_execution(status, Some(&summary), None).await;
        self.notify(status, &summary, is_silent).await;
    }

    async fn handle_error(&self, event: &ExecutionEvent) {
        let message = event.error.as_deref().unwrap_or("Unknown error");
        self.update_execution("FAILED", None, Some(message)).await;
        self.notify("FAILED", &format!("Task failed: {message}"), false)
            .await;
    }
}

#[async_trait]
impl ResultEmitter for SubscriptionEmitter {
    async fn emit(&self, event: ExecutionEvent) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                execution_id = self.execution_id,
                "subscription emitter closed, dropping event"
            );
            return;
        }

        match event.event_type {
            EventType::Chunk => {
                self.accumulated.lock().push_str(&event.content);
            }
            EventType::Done => self.handle_done(&event).await,
            EventType::Error => self.handle_error(&event).await,
            EventType::Cancelled => {
                self.update_execution("CANCELLED", None, None).await;
            }
            _ => {}
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
