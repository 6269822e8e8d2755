//! Typed interface to the resource store.
//!
//! The store itself (Task, Bot, Ghost, Shell, Model, Team resources and
//! the subtask rows) lives in an external data service; the control
//! plane only knows this trait. [`HttpDataService`] is the deployment
//! path; [`MemoryDataService`] backs the test suite and documents the
//! expected semantics — in particular namespace visibility and the
//! task status mirror.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tm_domain::request::{AttachmentRef, UserRef};
use tm_domain::task::{SubtaskPatch, SubtaskRole, TaskMirror, TaskRecord};
use tm_domain::{Result, Subtask};

pub use http::HttpDataService;
pub use memory::MemoryDataService;

/// Owner id marking a public (shared) resource.
pub const PUBLIC_OWNER: i64 = 0;
pub const DEFAULT_NAMESPACE: &str = "default";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resource records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostRecord {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub user_id: i64,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRecord {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub user_id: i64,
    pub shell_type: String,
    #[serde(default)]
    pub base_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub user_id: i64,
    /// Opaque provider config; `env.api_key` may be encrypted at rest.
    pub model_config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRecord {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub user_id: i64,
    pub ghost_name: String,
    #[serde(default)]
    pub ghost_namespace: Option<String>,
    pub shell_name: String,
    #[serde(default)]
    pub shell_namespace: Option<String>,
    #[serde(default)]
    pub agent_config: Option<Value>,
    #[serde(default)]
    pub mcp_servers: Option<Value>,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl BotRecord {
    /// Model bound directly on the bot's agent config, if any.
    pub fn bind_model(&self) -> Option<&str> {
        self.agent_config
            .as_ref()
            .and_then(|c| c.get("bind_model"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub bot_id: i64,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRecord {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub user_id: i64,
    /// "pipeline" teams advance one member per assistant turn.
    #[serde(default)]
    pub mode: Option<String>,
    pub members: Vec<TeamMember>,
}

impl TeamRecord {
    pub fn is_pipeline(&self) -> bool {
        self.mode.as_deref() == Some("pipeline")
    }
}

/// Draft for a new subtask row; the store assigns id and message_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubtask {
    pub task_id: i64,
    pub role: SubtaskRole,
    pub user_id: i64,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub bot_ids: Vec<i64>,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Namespace visibility
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pick the visible resource among same-named candidates.
///
/// Non-default namespaces hold group resources: namespace match alone
/// decides. In the default namespace the owner's private copy wins,
/// falling back to the public copy (owner sentinel 0).
pub fn resolve_visible<'a, T>(
    candidates: &'a [T],
    namespace: &str,
    owner_id: i64,
    ns_of: impl Fn(&T) -> &str,
    owner_of: impl Fn(&T) -> i64,
) -> Option<&'a T> {
    if namespace != DEFAULT_NAMESPACE {
        return candidates.iter().find(|c| ns_of(c) == namespace);
    }
    candidates
        .iter()
        .find(|c| ns_of(c) == DEFAULT_NAMESPACE && owner_of(c) == owner_id)
        .or_else(|| {
            candidates
                .iter()
                .find(|c| ns_of(c) == DEFAULT_NAMESPACE && owner_of(c) == PUBLIC_OWNER)
        })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DataService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait DataService: Send + Sync {
    // ── Subtasks ────────────────────────────────────────────────────
    async fn get_subtask(&self, id: i64) -> Result<Option<Subtask>>;
    async fn create_subtask(&self, new: NewSubtask) -> Result<Subtask>;
    /// Apply a patch; assistant status changes also refresh the owning
    /// task's status mirror. Returns the updated row.
    async fn update_subtask(&self, id: i64, patch: SubtaskPatch) -> Result<Subtask>;
    /// Same-ID retry: back to PENDING with result/error cleared.
    async fn reset_subtask_for_retry(&self, id: i64) -> Result<Subtask>;
    async fn latest_assistant_subtask(&self, task_id: i64) -> Result<Option<Subtask>>;
    async fn running_assistant_subtask(&self, task_id: i64) -> Result<Option<Subtask>>;
    async fn subtasks_after(&self, task_id: i64, after_message_id: i64) -> Result<Vec<Subtask>>;
    async fn find_user_subtask_by_message(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<Option<Subtask>>;
    /// Number of assistant subtasks created before `message_id` — the
    /// pipeline index for member selection.
    async fn count_assistant_subtasks_before(&self, task_id: i64, message_id: i64)
        -> Result<usize>;
    async fn find_running_subtasks_by_executor(&self, executor_name: &str)
        -> Result<Vec<Subtask>>;
    async fn list_pending_assistant_subtasks(
        &self,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<Subtask>>;

    // ── Tasks ───────────────────────────────────────────────────────
    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>>;
    async fn create_task(
        &self,
        user_id: i64,
        team_id: Option<i64>,
        title: Option<String>,
        labels: serde_json::Map<String, Value>,
    ) -> Result<TaskRecord>;
    async fn update_task_mirror(&self, task_id: i64, mirror: TaskMirror) -> Result<()>;
    /// Owner, active member, or shared-task receiver.
    async fn can_access_task(&self, task_id: i64, user_id: i64) -> Result<bool>;

    // ── Resources ───────────────────────────────────────────────────
    async fn get_team(&self, id: i64) -> Result<Option<TeamRecord>>;
    async fn get_bot(&self, id: i64) -> Result<Option<BotRecord>>;
    async fn find_ghost(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<GhostRecord>>;
    async fn find_shell(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<ShellRecord>>;
    async fn find_model(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<ModelRecord>>;

    // ── Users & attachments ─────────────────────────────────────────
    async fn get_user(&self, id: i64) -> Result<Option<UserRef>>;
    /// Descriptors for READY attachments only.
    async fn list_ready_attachments(&self, ids: &[i64]) -> Result<Vec<AttachmentRef>>;

    // ── Background executions (subscription tasks) ──────────────────
    async fn update_background_execution(
        &self,
        execution_id: i64,
        status: &str,
        result_summary: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;
}
