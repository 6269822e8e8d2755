//! HTTP `DataService` against the external resource-store service.
//!
//! Mechanical REST binding: every trait call is one request under
//! `/internal/data/…`, authenticated with the shared internal token.
//! 404 maps to `None`; other non-2xx statuses surface as errors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use tm_domain::request::{AttachmentRef, UserRef};
use tm_domain::task::{SubtaskPatch, TaskMirror, TaskRecord};
use tm_domain::{Error, Result, Subtask};

use super::{BotRecord, DataService, GhostRecord, ModelRecord, NewSubtask, ShellRecord, TeamRecord};

pub struct HttpDataService {
    http: reqwest::Client,
    base_url: String,
    internal_token: String,
}

impl HttpDataService {
    pub fn new(base_url: &str, internal_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: format!("{}/internal/data", base_url.trim_end_matches('/')),
            internal_token: internal_token.to_owned(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base_url));
        if self.internal_token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.internal_token)
        }
    }

    async fn fetch_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::http_status(
                response.status().as_u16(),
                &response.text().await.unwrap_or_default(),
            ));
        }
        Ok(Some(
            response
                .json()
                .await
                .map_err(|e| Error::Http(e.to_string()))?,
        ))
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .request(method, path)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::http_status(
                response.status().as_u16(),
                &response.text().await.unwrap_or_default(),
            ));
        }
        response.json().await.map_err(|e| Error::Http(e.to_string()))
    }
}

/// Wire form of a subtask patch (SubtaskPatch is not serde-serializable
/// by design — the wire has explicit nullable fields).
fn patch_body(patch: &SubtaskPatch) -> Value {
    serde_json::json!({
        "status": patch.status,
        "result": patch.result,
        "progress": patch.progress,
        "error_message": patch.error_message,
        "executor_name": patch.executor_name,
        "executor_namespace": patch.executor_namespace,
    })
}

#[async_trait]
impl DataService for HttpDataService {
    async fn get_subtask(&self, id: i64) -> Result<Option<Subtask>> {
        self.fetch_optional(&format!("/subtasks/{id}")).await
    }

    async fn create_subtask(&self, new: NewSubtask) -> Result<Subtask> {
        self.send_json(reqwest::Method::POST, "/subtasks", &new).await
    }

    async fn update_subtask(&self, id: i64, patch: SubtaskPatch) -> Result<Subtask> {
        // The store applies the task status mirror for assistant rows.
        self.send_json(
            reqwest::Method::PATCH,
            &format!("/subtasks/{id}"),
            &patch_body(&patch),
        )
        .await
    }

    async fn reset_subtask_for_retry(&self, id: i64) -> Result<Subtask> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/subtasks/{id}/reset"),
            &Value::Null,
        )
        .await
    }

    async fn latest_assistant_subtask(&self, task_id: i64) -> Result<Option<Subtask>> {
        self.fetch_optional(&format!("/tasks/{task_id}/subtasks/latest-assistant"))
            .await
    }

    async fn running_assistant_subtask(&self, task_id: i64) -> Result<Option<Subtask>> {
        self.fetch_optional(&format!("/tasks/{task_id}/subtasks/running-assistant"))
            .await
    }

    async fn subtasks_after(&self, task_id: i64, after_message_id: i64) -> Result<Vec<Subtask>> {
        Ok(self
            .fetch_optional(&format!(
                "/tasks/{task_id}/subtasks?after_message_id={after_message_id}"
            ))
            .await?
            .unwrap_or_default())
    }

    async fn find_user_subtask_by_message(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<Option<Subtask>> {
        self.fetch_optional(&format!(
            "/tasks/{task_id}/subtasks/user-by-message/{message_id}"
        ))
        .await
    }

    async fn count_assistant_subtasks_before(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<usize> {
        #[derive(serde::Deserialize)]
        struct CountResponse {
            count: usize,
        }
        let response: Option<CountResponse> = self
            .fetch_optional(&format!(
                "/tasks/{task_id}/subtasks/assistant-count?before_message_id={message_id}"
            ))
            .await?;
        Ok(response.map(|r| r.count).unwrap_or(0))
    }

    async fn find_running_subtasks_by_executor(
        &self,
        executor_name: &str,
    ) -> Result<Vec<Subtask>> {
        Ok(self
            .fetch_optional(&format!("/subtasks/running?executor_name={executor_name}"))
            .await?
            .unwrap_or_default())
    }

    async fn list_pending_assistant_subtasks(
        &self,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<Subtask>> {
        Ok(self
            .fetch_optional(&format!(
                "/subtasks/pending?task_type={task_type}&limit={limit}"
            ))
            .await?
            .unwrap_or_default())
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        self.fetch_optional(&format!("/tasks/{id}")).await
    }

    async fn create_task(
        &self,
        user_id: i64,
        team_id: Option<i64>,
        title: Option<String>,
        labels: serde_json::Map<String, Value>,
    ) -> Result<TaskRecord> {
        self.send_json(
            reqwest::Method::POST,
            "/tasks",
            &serde_json::json!({
                "user_id": user_id,
                "team_id": team_id,
                "title": title,
                "labels": labels,
            }),
        )
        .await
    }

    async fn update_task_mirror(&self, task_id: i64, mirror: TaskMirror) -> Result<()> {
        let _: Value = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/tasks/{task_id}/status"),
                &serde_json::json!({
                    "status": mirror.status,
                    "progress": mirror.progress,
                    "result": mirror.result,
                    "error_message": mirror.error_message,
                    "set_completed_at": mirror.set_completed_at,
                }),
            )
            .await?;
        Ok(())
    }

    async fn can_access_task(&self, task_id: i64, user_id: i64) -> Result<bool> {
        #[derive(serde::Deserialize)]
        struct AccessResponse {
            allowed: bool,
        }
        let response: Option<AccessResponse> = self
            .fetch_optional(&format!("/tasks/{task_id}/access/{user_id}"))
            .await?;
        Ok(response.map(|r| r.allowed).unwrap_or(false))
    }

    async fn get_team(&self, id: i64) -> Result<Option<TeamRecord>> {
        self.fetch_optional(&format!("/teams/{id}")).await
    }

    async fn get_bot(&self, id: i64) -> Result<Option<BotRecord>> {
        self.fetch_optional(&format!("/bots/{id}")).await
    }

    async fn find_ghost(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<GhostRecord>> {
        self.fetch_optional(&format!(
            "/ghosts/resolve?name={name}&namespace={namespace}&owner_id={owner_id}"
        ))
        .await
    }

    async fn find_shell(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<ShellRecord>> {
        self.fetch_optional(&format!(
            "/shells/resolve?name={name}&namespace={namespace}&owner_id={owner_id}"
        ))
        .await
    }

    async fn find_model(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<ModelRecord>> {
        self.fetch_optional(&format!(
            "/models/resolve?name={name}&namespace={namespace}&owner_id={owner_id}"
        ))
        .await
    }

    async fn get_user(&self, id: i64) -> Result<Option<UserRef>> {
        self.fetch_optional(&format!("/users/{id}")).await
    }

    async fn list_ready_attachments(&self, ids: &[i64]) -> Result<Vec<AttachmentRef>> {
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Ok(self
            .fetch_optional(&format!("/attachments?ids={joined}&status=READY"))
            .await?
            .unwrap_or_default())
    }

    async fn update_background_execution(
        &self,
        execution_id: i64,
        status: &str,
        result_summary: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let _: Value = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/background-executions/{execution_id}"),
                &serde_json::json!({
                    "status": status,
                    "result_summary": result_summary,
                    "error_message": error_message,
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_domain::task::SubtaskStatus;

    #[test]
    fn patch_body_carries_explicit_nulls() {
        let patch = SubtaskPatch::status(SubtaskStatus::Failed).with_error("boom");
        let body = patch_body(&patch);
        assert_eq!(body["status"], "FAILED");
        assert_eq!(body["error_message"], "boom");
        assert!(body["result"].is_null());
        assert!(body["executor_name"].is_null());
    }
}
