//! HTTP client for the control plane's internal task API.
//!
//! The consumer and the heartbeat scanner report failures and fetch
//! pull-mode work through this interface. `TaskStatusSink` is the seam:
//! a standalone manager uses [`TaskApiClient`] over HTTP, while an
//! embedded manager is handed the gateway's in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use tm_domain::{Error, ExecutionRequest, Result};

/// How worker-side components report task failure back to the backend.
#[async_trait]
pub trait TaskStatusSink: Send + Sync {
    async fn mark_task_failed(
        &self,
        task_id: i64,
        subtask_id: i64,
        error_message: &str,
        executor_name: Option<&str>,
    ) -> Result<()>;
}

pub struct TaskApiClient {
    http: reqwest::Client,
    base_url: String,
    internal_token: String,
}

#[derive(Debug, Deserialize)]
struct PendingTasksResponse {
    #[serde(default)]
    tasks: Vec<ExecutionRequest>,
}

impl TaskApiClient {
    pub fn new(base_url: &str, internal_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            internal_token: internal_token.to_owned(),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.internal_token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.internal_token)
        }
    }

    /// Update subtask (and derived task) status fields.
    pub async fn update_task_status(
        &self,
        task_id: i64,
        subtask_id: i64,
        status: &str,
        progress: u8,
        result: Option<Value>,
        error_message: Option<&str>,
        executor_name: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/internal/tasks/status", self.base_url);
        let body = serde_json::json!({
            "task_id": task_id,
            "subtask_id": subtask_id,
            "status": status,
            "progress": progress,
            "result": result,
            "error_message": error_message,
            "executor_name": executor_name,
        });
        let response = self
            .authorized(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::http_status(
                response.status().as_u16(),
                &response.text().await.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    /// Pull-mode fetch: up to `limit` pending requests of `task_type`.
    pub async fn fetch_pending(&self, task_type: &str, limit: usize) -> Result<Vec<ExecutionRequest>> {
        let url = format!(
            "{}/internal/tasks/pending?task_type={task_type}&limit={limit}",
            self.base_url
        );
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::http_status(response.status().as_u16(), "fetch failed"));
        }
        let parsed: PendingTasksResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(parsed.tasks)
    }
}

#[async_trait]
impl TaskStatusSink for TaskApiClient {
    async fn mark_task_failed(
        &self,
        task_id: i64,
        subtask_id: i64,
        error_message: &str,
        executor_name: Option<&str>,
    ) -> Result<()> {
        self.update_task_status(
            task_id,
            subtask_id,
            "FAILED",
            0,
            Some(serde_json::json!({ "value": error_message })),
            Some(error_message),
            executor_name,
        )
        .await
    }
}
