//! The `ExecutionRequest` — the self-describing unit of work handed to an
//! executor, assembled by the request builder from the task graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn default_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Nested records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One bot participating in the turn. `agent_config` stays opaque: the
/// builder replaces it with the resolved model's config before dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
}

impl BotSpec {
    pub fn shell_type(&self) -> &str {
        self.shell_type.as_deref().unwrap_or("Chat")
    }
}

/// The requesting user, including git credentials for workspace checkout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_token: Option<String>,
}

/// Attachment descriptor. Only metadata travels with the request; the
/// worker downloads content by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: i64,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: i64,
    pub subtask_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_namespace: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Resolved model configuration, decrypted credentials included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bot: Vec<BotSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<u32>,
    #[serde(default = "default_true")]
    pub enable_tools: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_web_search: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub enable_clarification: bool,
    #[serde(default = "default_true")]
    pub enable_deep_thinking: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preload_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_subscription: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge_base_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub document_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub table_contexts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    /// Short-lived user JWT for skill downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// HS256 token scoping MCP calls to this task/subtask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_mcp_config: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub new_session: bool,
    /// Worker classification: online | offline | validation | subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Team execution mode (pipeline | default), stamped on the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_mode: Option<String>,
    /// Next subtask in a pipeline, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_next_id: Option<i64>,
    /// Propagated trace context, opaque to the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<Value>,
    /// Queue-layer retry counter. Not part of the executor contract.
    #[serde(rename = "_retry_count", default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
}

impl ExecutionRequest {
    pub fn new(task_id: i64, subtask_id: i64) -> Self {
        Self {
            task_id,
            subtask_id,
            enable_tools: true,
            enable_deep_thinking: true,
            ..Default::default()
        }
    }

    /// Shell type of the leading bot, defaulting to "Chat" when the bot
    /// list is empty.
    pub fn shell_type(&self) -> &str {
        self.bot.first().map(BotSpec::shell_type).unwrap_or("Chat")
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user.as_ref().map(|u| u.id)
    }

    pub fn task_type(&self) -> &str {
        self.task_type.as_deref().unwrap_or("online")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
