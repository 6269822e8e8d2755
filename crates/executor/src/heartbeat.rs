//! Heartbeat scanner: declares workers dead when their heartbeat key is
//! gone past the grace period, fails the owning subtask, and cleans up.
//!
//! OOM-killed containers stop heartbeating without sending any terminal
//! callback; this scanner is the only path that ever notices them. One
//! replica runs the scan per interval, guarded by a Redis lock.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tm_domain::config::HeartbeatConfig;
use tm_domain::Result;
use tm_state::{DistributedLock, HeartbeatStore, RunningTaskMeta, RunningTaskTracker};

use crate::api_client::TaskStatusSink;
use crate::manager::ExecutorService;

const SCAN_LOCK_KEY: &str = "lock:task_heartbeat_check";
const SCAN_LOCK_TTL_SECS: u64 = 30;

/// Fixed user-facing failure message for heartbeat-detected deaths.
pub const EXECUTOR_CRASHED_MESSAGE: &str =
    "Executor crashed unexpectedly (possible OOM). Please check if your task requires more memory.";

pub struct HeartbeatChecker {
    tracker: RunningTaskTracker,
    heartbeats: HeartbeatStore,
    lock: DistributedLock,
    service: Arc<ExecutorService>,
    sink: Arc<dyn TaskStatusSink>,
    config: HeartbeatConfig,
}

impl HeartbeatChecker {
    pub fn new(
        tracker: RunningTaskTracker,
        heartbeats: HeartbeatStore,
        lock: DistributedLock,
        service: Arc<ExecutorService>,
        sink: Arc<dyn TaskStatusSink>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            tracker,
            heartbeats,
            lock,
            service,
            sink,
            config,
        }
    }

    /// Scan loop; runs until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            if let Err(e) = self.check_once().await {
                tracing::error!(error = %e, "heartbeat scan failed");
            }
        }
        tracing::info!("heartbeat checker stopped");
    }

    /// One scan pass. Returns false when another replica held the lock.
    pub async fn check_once(&self) -> Result<bool> {
        let Some(handle) = self.lock.acquire(SCAN_LOCK_KEY, SCAN_LOCK_TTL_SECS).await? else {
            tracing::debug!("heartbeat check already running on another replica");
            return Ok(false);
        };

        let result = self.scan().await;
        let _ = self.lock.release(&handle).await;
        result?;
        Ok(true)
    }

    async fn scan(&self) -> Result<()> {
        let running = self.tracker.all_with_meta().await?;
        if running.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        for meta in running {
            let age = now - meta.start_time;
            if age < self.config.grace_period_secs as f64 {
                continue;
            }

            match self.heartbeats.is_alive(meta.task_id).await {
                Ok(true) => {}
                Ok(false) => {
                    let last = self.heartbeats.last_seen(meta.task_id).await.ok().flatten();
                    tracing::warn!(
                        task_id = meta.task_id,
                        subtask_id = meta.subtask_id,
                        executor_name = %meta.executor_name,
                        age_secs = age as i64,
                        last_heartbeat = ?last,
                        "heartbeat timeout, declaring worker dead"
                    );
                    self.handle_dead(&meta).await;
                }
                Err(e) => {
                    tracing::debug!(task_id = meta.task_id, error = %e, "heartbeat check error");
                }
            }
        }
        Ok(())
    }

    async fn handle_dead(&self, meta: &RunningTaskMeta) {
        if let Err(e) = self
            .sink
            .mark_task_failed(
                meta.task_id,
                meta.subtask_id,
                EXECUTOR_CRASHED_MESSAGE,
                Some(&meta.executor_name),
            )
            .await
        {
            tracing::error!(task_id = meta.task_id, error = %e, "failed to mark dead task failed");
        }

        if let Err(e) = self.heartbeats.delete(meta.task_id).await {
            tracing::warn!(task_id = meta.task_id, error = %e, "failed to delete heartbeat key");
        }
        if let Err(e) = self.tracker.remove(meta.task_id).await {
            tracing::warn!(task_id = meta.task_id, error = %e, "failed to remove registry entry");
        }

        if self.config.delete_zombie_containers {
            if let Err(e) = self
                .service
                .executor()
                .delete_executor(&meta.executor_name)
                .await
            {
                tracing::warn!(
                    executor_name = %meta.executor_name,
                    error = %e,
                    "failed to delete zombie container"
                );
            }
        } else {
            tracing::info!(
                executor_name = %meta.executor_name,
                "zombie container preserved for debugging (delete_zombie_containers=false)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_message_names_oom() {
        assert!(EXECUTOR_CRASHED_MESSAGE.contains("possible OOM"));
        assert!(EXECUTOR_CRASHED_MESSAGE.contains("memory"));
    }
}
