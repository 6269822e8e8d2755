//! Periodic jobs: pull-mode task fetching and supervision of the
//! heartbeat scan cadence.
//!
//! Pull mode polls the task API for pending work whenever container
//! slots are free; push mode leaves fetching to the queue consumers and
//! this scheduler only drives the heartbeat scanner.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tokio_util::sync::CancellationToken;

use tm_domain::config::{parse_hour_range, DispatchMode, QueueConfig};

use crate::api_client::TaskApiClient;
use crate::consumer::in_offline_window;
use crate::heartbeat::HeartbeatChecker;
use crate::manager::ExecutorService;

const TASK_TYPE_LABEL: &str = "aigc.weibo.com/task-type";

/// Slots to fetch this round: never more than 10 at once, never beyond
/// the concurrency budget.
pub fn available_slots(max_concurrent: usize, running: usize) -> usize {
    max_concurrent.saturating_sub(running).min(10)
}

pub struct Scheduler {
    config: QueueConfig,
    service: Arc<ExecutorService>,
    api: Arc<TaskApiClient>,
    checker: Arc<HeartbeatChecker>,
}

impl Scheduler {
    pub fn new(
        config: QueueConfig,
        service: Arc<ExecutorService>,
        api: Arc<TaskApiClient>,
        checker: Arc<HeartbeatChecker>,
    ) -> Self {
        Self {
            config,
            service,
            api,
            checker,
        }
    }

    /// Spawn all periodic jobs; returns once they are running.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) {
        {
            let checker = self.checker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { checker.run(shutdown).await });
        }

        if self.config.dispatch_mode == DispatchMode::Pull {
            let scheduler = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.fetch_loop(shutdown).await });
        }

        tracing::info!(mode = ?self.config.dispatch_mode, "scheduler started");
    }

    async fn fetch_loop(&self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.task_fetch_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            if let Err(e) = self.fetch_round("online", self.config.max_concurrent_tasks).await {
                tracing::error!(error = %e, "online fetch round failed");
            }

            if self.offline_window_open() {
                if let Err(e) = self
                    .fetch_round("offline", self.config.max_offline_concurrent_tasks)
                    .await
                {
                    tracing::error!(error = %e, "offline fetch round failed");
                }
            }
        }
        tracing::info!("pull-mode fetch loop stopped");
    }

    async fn fetch_round(&self, task_type: &str, max_concurrent: usize) -> tm_domain::Result<()> {
        let running = self
            .service
            .executor()
            .running_count(Some(&format!("{TASK_TYPE_LABEL}={task_type}")))
            .await?;
        let slots = available_slots(max_concurrent, running);
        if slots == 0 {
            tracing::debug!(task_type, running, "no free slots, skipping fetch");
            return Ok(());
        }

        let tasks = self.api.fetch_pending(task_type, slots).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        tracing::info!(task_type, count = tasks.len(), "fetched pending tasks");

        for request in tasks {
            if let Err(e) = self.service.submit_and_register(&request).await {
                tracing::error!(
                    task_id = request.task_id,
                    subtask_id = request.subtask_id,
                    error = %e,
                    "pull-mode submit failed"
                );
            }
        }
        Ok(())
    }

    fn offline_window_open(&self) -> bool {
        let evening = parse_hour_range(&self.config.offline_evening_hours).unwrap_or((21, 23));
        let morning = parse_hour_range(&self.config.offline_morning_hours).unwrap_or((0, 8));
        in_offline_window(Local::now().hour(), evening, morning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_respect_budget_and_cap() {
        assert_eq!(available_slots(30, 0), 10);
        assert_eq!(available_slots(30, 25), 5);
        assert_eq!(available_slots(30, 30), 0);
        assert_eq!(available_slots(30, 40), 0);
        assert_eq!(available_slots(5, 2), 3);
    }
}
