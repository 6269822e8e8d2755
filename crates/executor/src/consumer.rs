//! Push-mode queue consumer with capacity backpressure.
//!
//! One consumer per (pool, queue type). Before touching Redis it checks
//! the running-container count (cached ~1 s so Docker is not hammered);
//! at capacity it sleeps instead of dequeueing. The offline consumer only
//! drains during the configured evening/morning hour windows. A dispatch
//! failure requeues with a bumped retry counter; past the limit the task
//! is failed through the status sink.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tm_domain::config::{parse_hour_range, QueueConfig};
use tm_domain::{ExecutionRequest, Result};
use tm_state::{QueueType, TaskQueue};

use crate::api_client::TaskStatusSink;
use crate::manager::ExecutorService;

/// True when `hour` falls inside either inclusive window.
pub fn in_offline_window(hour: u32, evening: (u32, u32), morning: (u32, u32)) -> bool {
    (evening.0 <= hour && hour <= evening.1) || (morning.0 <= hour && hour <= morning.1)
}

struct CapacityCache {
    checked_at: Option<Instant>,
    has_capacity: bool,
}

pub struct QueueConsumer {
    queue: TaskQueue,
    queue_type: QueueType,
    service: Arc<ExecutorService>,
    sink: Arc<dyn TaskStatusSink>,
    config: QueueConfig,
    capacity: Mutex<CapacityCache>,
}

impl QueueConsumer {
    pub fn new(
        queue: TaskQueue,
        queue_type: QueueType,
        service: Arc<ExecutorService>,
        sink: Arc<dyn TaskStatusSink>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            queue_type,
            service,
            sink,
            config,
            capacity: Mutex::new(CapacityCache {
                checked_at: None,
                has_capacity: true,
            }),
        }
    }

    /// Consume until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            queue = %self.queue.key(),
            max_concurrent = self.max_concurrent(),
            "queue consumer started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self.tick(&shutdown).await {
                tracing::error!(queue = %self.queue.key(), error = %e, "consumer tick failed");
                // Avoid a tight loop on persistent Redis/Docker errors.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        tracing::info!(queue = %self.queue.key(), "queue consumer stopped");
    }

    async fn tick(&self, shutdown: &CancellationToken) -> Result<()> {
        // Offline tasks only run inside the configured windows.
        if self.queue_type == QueueType::Offline && !self.offline_window_open() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                _ = shutdown.cancelled() => {}
            }
            return Ok(());
        }

        if !self.has_capacity().await {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.backpressure_wait_ms)) => {}
                _ = shutdown.cancelled() => {}
            }
            return Ok(());
        }

        let Some(request) = self.queue.dequeue(self.config.dequeue_timeout_secs).await? else {
            return Ok(());
        };
        self.process(request).await;
        Ok(())
    }

    async fn process(&self, request: ExecutionRequest) {
        let task_id = request.task_id;
        let subtask_id = request.subtask_id;
        if request.retry_count > 0 {
            tracing::info!(
                task_id,
                subtask_id,
                retry = request.retry_count,
                "processing queued task"
            );
        } else {
            tracing::info!(task_id, subtask_id, "processing queued task");
        }

        match self.service.submit_and_register(&request).await {
            Ok(outcome) => {
                tracing::info!(
                    task_id,
                    subtask_id,
                    executor_name = %outcome.executor_name,
                    reused = outcome.reused,
                    "task submitted to executor"
                );
            }
            Err(e) => self.handle_failure(request, &e.to_string()).await,
        }
    }

    async fn handle_failure(&self, request: ExecutionRequest, error_msg: &str) {
        let task_id = request.task_id;
        let subtask_id = request.subtask_id;

        match self.queue.requeue(request).await {
            Ok(decision) if decision.should_retry => {}
            Ok(decision) => {
                let message = format!(
                    "Task failed after {} retries: {error_msg}",
                    decision.retry_count
                );
                tracing::error!(task_id, subtask_id, %message, "task exhausted retries");
                if let Err(e) = self
                    .sink
                    .mark_task_failed(task_id, subtask_id, &message, None)
                    .await
                {
                    tracing::error!(task_id, subtask_id, error = %e, "failed to report task failure");
                }
            }
            Err(e) => {
                tracing::error!(task_id, subtask_id, error = %e, "failed to requeue task");
            }
        }
    }

    fn max_concurrent(&self) -> usize {
        match self.queue_type {
            QueueType::Online => self.config.max_concurrent_tasks,
            QueueType::Offline => self.config.max_offline_concurrent_tasks,
        }
    }

    fn offline_window_open(&self) -> bool {
        let evening = parse_hour_range(&self.config.offline_evening_hours).unwrap_or((21, 23));
        let morning = parse_hour_range(&self.config.offline_morning_hours).unwrap_or((0, 8));
        in_offline_window(Local::now().hour(), evening, morning)
    }

    /// Capacity check against the container count, cached briefly.
    /// Errors count as "has capacity" so a flapping Docker daemon does
    /// not stall the queue.
    async fn has_capacity(&self) -> bool {
        {
            let cache = self.capacity.lock();
            if let Some(at) = cache.checked_at {
                if at.elapsed() < Duration::from_millis(self.config.capacity_cache_ttl_ms) {
                    return cache.has_capacity;
                }
            }
        }

        let has_capacity = match self.service.executor().running_count(None).await {
            Ok(running) => {
                let max = self.max_concurrent();
                let has = running < max;
                tracing::debug!(running, max, has_capacity = has, "capacity check");
                has
            }
            Err(e) => {
                tracing::warn!(error = %e, "capacity check failed, assuming available");
                true
            }
        };

        let mut cache = self.capacity.lock();
        cache.checked_at = Some(Instant::now());
        cache.has_capacity = has_capacity;
        has_capacity
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_window_covers_evening_and_morning() {
        let evening = (21, 23);
        let morning = (0, 8);

        assert!(in_offline_window(21, evening, morning));
        assert!(in_offline_window(22, evening, morning));
        assert!(in_offline_window(23, evening, morning));
        assert!(in_offline_window(0, evening, morning));
        assert!(in_offline_window(5, evening, morning));
        assert!(in_offline_window(8, evening, morning));

        assert!(!in_offline_window(9, evening, morning));
        assert!(!in_offline_window(12, evening, morning));
        assert!(!in_offline_window(20, evening, morning));
    }

    #[test]
    fn offline_window_inclusive_edges() {
        assert!(in_offline_window(8, (21, 23), (0, 8)));
        assert!(!in_offline_window(9, (21, 23), (0, 8)));
        assert!(in_offline_window(21, (21, 23), (0, 8)));
        assert!(!in_offline_window(20, (21, 23), (0, 8)));
    }
}
