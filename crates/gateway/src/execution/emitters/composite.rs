//! Composite emitter: fan-out to several children with isolation — one
//! child's sink going away never starves the siblings.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use tm_domain::ExecutionEvent;

use super::ResultEmitter;

pub struct CompositeEmitter {
    emitters: Vec<Arc<dyn ResultEmitter>>,
}

impl CompositeEmitter {
    pub fn new(emitters: Vec<Arc<dyn ResultEmitter>>) -> Self {
        Self { emitters }
    }

    pub fn push(&mut self, emitter: Arc<dyn ResultEmitter>) {
        self.emitters.push(emitter);
    }

    pub fn len(&self) -> usize {
        self.emitters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitters.is_empty()
    }
}

#[async_trait]
impl ResultEmitter for CompositeEmitter {
    async fn emit(&self, event: ExecutionEvent) {
        join_all(
            self.emitters
                .iter()
                .map(|emitter| emitter.emit(event.clone())),
        )
        .await;
    }

    async fn close(&self) {
        join_all(self.emitters.iter().map(|emitter| emitter.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl ResultEmitter for Recorder {
        async fn emit(&self, event: ExecutionEvent) {
            self.seen.lock().push(event.event_type.as_str().to_owned());
        }
        async fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_children() {
        let a = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
            closed: Mutex::new(false),
        });
        let b = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
            closed: Mutex::new(false),
        });
        let composite = CompositeEmitter::new(vec![a.clone(), b.clone()]);

        composite.emit_chunk(42, 7, "x", 0).await;
        composite.emit_done(42, 7, None).await;
        composite.close().await;

        assert_eq!(a.seen.lock().as_slice(), &["chunk", "done"]);
        assert_eq!(b.seen.lock().as_slice(), &["chunk", "done"]);
        assert!(*a.closed.lock());
        assert!(*b.closed.lock());
    }

    #[tokio::test]
    async fn empty_composite_is_a_noop() {
        let composite = CompositeEmitter::new(vec![]);
        assert!(composite.is_empty());
        composite.emit_chunk(1, 2, "x", 0).await;
        composite.close().await;
    }
}
