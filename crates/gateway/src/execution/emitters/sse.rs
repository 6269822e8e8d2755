//! Queue-backed SSE emitter.
//!
//! The dispatcher produces into an unbounded channel while an HTTP
//! handler consumes. `stream()` yields events until the first terminal;
//! `collect()` drains the stream and returns the accumulated text with
//! the final event (the synchronous convenience).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tm_domain::{EventType, ExecutionEvent};

use super::ResultEmitter;

pub struct SseEmitter {
    task_id: i64,
    subtask_id: i64,
    tx: mpsc::UnboundedSender<Option<ExecutionEvent>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Option<ExecutionEvent>>>>,
    closed: AtomicBool,
}

impl SseEmitter {
    pub fn new(task_id: i64, subtask_id: i64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            task_id,
            subtask_id,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn subtask_id(&self) -> i64 {
        self.subtask_id
    }

    /// Consume the event stream. Single consumer: the first call takes
    /// the receiver, later calls get an empty stream.
    pub fn stream(&self) -> impl Stream<Item = ExecutionEvent> + Send + 'static {
        let rx = self.rx.lock().take();
        async_stream::stream! {
            let Some(mut rx) = rx else { return };
            while let Some(item) = rx.recv().await {
                let Some(event) = item else { break };
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        }
    }

    /// The stream rendered as SSE frames (`data: <json>\n\n`).
    pub fn stream_sse(&self) -> impl Stream<Item = String> + Send + 'static {
        let events = self.stream();
        async_stream::stream! {
            futures_util::pin_mut!(events);
            while let Some(event) = futures_util::StreamExt::next(&mut events).await {
                yield event.to_sse_frame();
            }
        }
    }

    /// Await the terminal event, returning accumulated chunk text and
    /// the final (done/error) event if one arrived.
    pub async fn collect(&self) -> (String, Option<ExecutionEvent>) {
        let events = self.stream();
        futures_util::pin_mut!(events);

        let mut accumulated = String::new();
        let mut final_event = None;
        while let Some(event) = futures_util::StreamExt::next(&mut events).await {
            match event.event_type {
                EventType::Chunk => accumulated.push_str(&event.content),
                EventType::Done | EventType::Error => {
                    final_event = Some(event);
                    break;
                }
                EventType::Cancelled => break,
                _ => {}
            }
        }
        (accumulated, final_event)
    }
}

#[async_trait]
impl ResultEmitter for SseEmitter {
    async fn emit(&self, event: ExecutionEvent) {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                subtask_id = self.subtask_id,
                event_type = event.event_type.as_str(),
                "sse emitter closed, dropping event"
            );
            return;
        }
        let _ = self.tx.send(Some(event));
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(None);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
