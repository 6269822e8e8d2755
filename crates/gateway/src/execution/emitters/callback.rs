//! HTTP callback emitters: POST each event (or batches of events) to a
//! caller-provided URL. Delivery failures are logged, never raised —
//! a broken callback listener must not kill the producing stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tm_domain::ExecutionEvent;

use super::ResultEmitter;

const DEFAULT_BATCH_SIZE: usize = 10;

pub struct CallbackEmitter {
    task_id: i64,
    subtask_id: i64,
    callback_url: String,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl CallbackEmitter {
    pub fn new(task_id: i64, subtask_id: i64, callback_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            task_id,
            subtask_id,
            callback_url: callback_url.to_owned(),
            http,
            closed: AtomicBool::new(false),
        }
    }

    async fn post_json<T: serde::Serialize>(&self, url: &str, body: &T) {
        match self.http.post(url).json(body).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    task_id = self.task_id,
                    subtask_id = self.subtask_id,
                    status = response.status().as_u16(),
                    url,
                    "callback rejected"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    task_id = self.task_id,
                    subtask_id = self.subtask_id,
                    error = %e,
                    url,
                    "callback failed"
                );
            }
        }
    }
}

#[async_trait]
impl ResultEmitter for CallbackEmitter {
    async fn emit(&self, event: ExecutionEvent) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                subtask_id = self.subtask_id,
                "callback emitter closed, dropping event"
            );
            return;
        }
        self.post_json(&self.callback_url, &event).await;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Batch variant
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Buffers events and POSTs them to `{url}/batch`; a terminal event or
/// a full buffer flushes immediately, close flushes the remainder.
pub struct BatchCallbackEmitter {
    inner: CallbackEmitter,
    batch_size: usize,
    buffer: Mutex<Vec<ExecutionEvent>>,
}

impl BatchCallbackEmitter {
    pub fn new(task_id: i64, subtask_id: i64, callback_url: &str, batch_size: Option<usize>) -> Self {
        Self {
            inner: CallbackEmitter::new(task_id, subtask_id, callback_url),
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn batch_url(callback_url: &str) -> String {
        format!("{}/batch", callback_url.trim_end_matches('/'))
    }

    async fn flush(&self) {
        let batch: Vec<ExecutionEvent> = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return;
        }
        let url = Self::batch_url(&self.inner.callback_url);
        self.inner.post_json(&url, &batch).await;
    }
}

#[async_trait]
impl ResultEmitter for BatchCallbackEmitter {
    async fn emit(&self, event: ExecutionEvent) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let should_flush = {
            let mut buffer = self.buffer.lock();
            let terminal = event.is_terminal();
            buffer.push(event);
            terminal || buffer.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await;
        }
    }

    async fn close(&self) {
        self.flush().await;
        self.inner.close().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_url_shape() {
        assert_eq!(
            BatchCallbackEmitter::batch_url("http://cb:9000/hook"),
            "http://cb:9000/hook/batch"
        );
        assert_eq!(
            BatchCallbackEmitter::batch_url("http://cb:9000/hook/"),
            "http://cb:9000/hook/batch"
        );
    }

    #[tokio::test]
    async fn batch_buffers_until_threshold() {
        // Unreachable URL: flush attempts fail and are swallowed, which
        // is exactly the contract under test.
        let emitter = BatchCallbackEmitter::new(42, 7, "http://127.0.0.1:1/cb", Some(3));
        emitter.emit_chunk(42, 7, "a", 0).await;
        emitter.emit_chunk(42, 7, "b", 1).await;
        assert_eq!(emitter.buffer.lock().len(), 2);

        // Third event reaches the threshold and flushes.
        emitter.emit_chunk(42, 7, "c", 2).await;
        assert!(emitter.buffer.lock().is_empty());
    }

    #[tokio::test]
    async fn terminal_event_flushes_immediately() {
        let emitter = BatchCallbackEmitter::new(42, 7, "http://127.0.0.1:1/cb", Some(100));
        emitter.emit_chunk(42, 7, "a", 0).await;
        emitter.emit_done(42, 7, None).await;
        assert!(emitter.buffer.lock().is_empty());
    }

    #[tokio::test]
    async fn closed_single_emitter_drops() {
        let emitter = CallbackEmitter::new(42, 7, "http://127.0.0.1:1/cb");
        emitter.close().await;
        // Should return immediately without an HTTP attempt.
        emitter.emit_chunk(42, 7, "x", 0).await;
    }
}
