//! Redis-list task queue for push-mode dispatch.
//!
//! Producers LPUSH, consumers BRPOP: FIFO per queue. Each service pool
//! gets its own online and offline queue so canary pools stay isolated.
//! Requests carry an embedded `_retry_count`; requeueing puts them at
//! the back of the queue rather than a dead-letter list.

use redis::AsyncCommands;

use tm_domain::{ExecutionRequest, Result};

use crate::store::{redis_err, StateStore};

const QUEUE_KEY_PREFIX: &str = "task_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Online,
    Offline,
}

impl QueueType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn for_task_type(task_type: &str) -> Self {
        if task_type == "offline" {
            Self::Offline
        } else {
            Self::Online
        }
    }
}

/// Requeue decision for a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub retry_count: u32,
}

/// Bump the embedded retry counter and decide whether the request goes
/// back on the queue.
pub fn bump_retry(request: &mut ExecutionRequest, max_retries: u32) -> RetryDecision {
    request.retry_count += 1;
    RetryDecision {
        should_retry: request.retry_count <= max_retries,
        retry_count: request.retry_count,
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    store: StateStore,
    queue_key: String,
    max_retries: u32,
}

pub fn queue_key(queue_type: QueueType, pool: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}:{}:{pool}", queue_type.as_str())
}

impl TaskQueue {
    pub fn new(store: StateStore, queue_type: QueueType, pool: &str, max_retries: u32) -> Self {
        Self {
            store,
            queue_key: queue_key(queue_type, pool),
            max_retries,
        }
    }

    pub fn key(&self) -> &str {
        &self.queue_key
    }

    pub async fn enqueue(&self, request: &ExecutionRequest) -> Result<()> {
        let raw = serde_json::to_string(request)?;
        let mut conn = self.store.conn().await?;
        conn.lpush::<_, _, ()>(&self.queue_key, raw)
            .await
            .map_err(redis_err)?;
        tracing::info!(
            task_id = request.task_id,
            subtask_id = request.subtask_id,
            queue = %self.queue_key,
            "task enqueued"
        );
        Ok(())
    }

    /// Blocking pop with timeout. Returns None on timeout; a request
    /// that fails to decode is dropped with a warning (a poison entry
    /// must not wedge the queue).
    pub async fn dequeue(&self, timeout_secs: u64) -> Result<Option<ExecutionRequest>> {
        let mut conn = self.store.conn().await?;
        let popped: Option<(String, String)> = conn
            .brpop(&self.queue_key, timeout_secs as f64)
            .await
            .map_err(redis_err)?;
        let Some((_, raw)) = popped else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(request) => Ok(Some(request)),
            Err(e) => {
                tracing::warn!(queue = %self.queue_key, error = %e, "dropping undecodable queue entry");
                Ok(None)
            }
        }
    }

    pub async fn len(&self) -> Result<usize> {
        let mut conn = self.store.conn().await?;
        conn.llen(&self.queue_key).await.map_err(redis_err)
    }

    /// Oldest-first peek without removal.
    pub async fn peek(&self, count: isize) -> Result<Vec<ExecutionRequest>> {
        let mut conn = self.store.conn().await?;
        let raws: Vec<String> = conn
            .lrange(&self.queue_key, -count, -1)
            .await
            .map_err(redis_err)?;
        Ok(raws
            .into_iter()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.delete(&self.queue_key).await?;
        tracing::warn!(queue = %self.queue_key, "queue cleared");
        Ok(())
    }

    /// Requeue a failed request with an incremented retry count.
    pub async fn requeue(&self, mut request: ExecutionRequest) -> Result<RetryDecision> {
        let decision = bump_retry(&mut request, self.max_retries);
        if decision.should_retry {
            self.enqueue(&request).await?;
            tracing::info!(
                task_id = request.task_id,
                subtask_id = request.subtask_id,
                retry = decision.retry_count,
                max = self.max_retries,
                "task requeued"
            );
        } else {
            tracing::warn!(
                task_id = request.task_id,
                subtask_id = request.subtask_id,
                retry = decision.retry_count,
                "task exceeded max retries, not requeuing"
            );
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(queue_key(QueueType::Online, "default"), "task_queue:online:default");
        assert_eq!(queue_key(QueueType::Offline, "canary"), "task_queue:offline:canary");
    }

    #[test]
    fn queue_type_for_task_type() {
        assert_eq!(QueueType::for_task_type("offline"), QueueType::Offline);
        assert_eq!(QueueType::for_task_type("online"), QueueType::Online);
        assert_eq!(QueueType::for_task_type("subscription"), QueueType::Online);
    }

    #[test]
    fn retry_bumps_until_max() {
        let mut request = ExecutionRequest::new(1, 2);

        let first = bump_retry(&mut request, 3);
        assert!(first.should_retry);
        assert_eq!(first.retry_count, 1);

        let second = bump_retry(&mut request, 3);
        let third = bump_retry(&mut request, 3);
        assert!(second.should_retry);
        assert!(third.should_retry);

        let fourth = bump_retry(&mut request, 3);
        assert!(!fourth.should_retry);
        assert_eq!(fourth.retry_count, 4);
    }

    #[test]
    fn retry_count_survives_serialization() {
        let mut request = ExecutionRequest::new(1, 2);
        bump_retry(&mut request, 3);
        let raw = serde_json::to_string(&request).unwrap();
        let back: ExecutionRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.retry_count, 1);
    }
}
