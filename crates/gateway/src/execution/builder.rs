//! Builds the `ExecutionRequest` from the persisted task graph.
//!
//! Resolution walks bot → ghost/shell/model with namespace visibility,
//! applies the model override policy, assembles prompts (pipeline-aware
//! member selection, previous-turn aggregation, stage confirmation),
//! merges user-selected skills, mints tokens, and attaches descriptors
//! for ready attachments. File bytes never ride in the request — the
//! worker downloads by id.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use tm_domain::config::AuthConfig;
use tm_domain::request::{BotSpec, UserRef};
use tm_domain::task::TaskRecord;
use tm_domain::{Error, ExecutionRequest, Result, Subtask};

use crate::auth::{CredentialCodec, TokenMinter};
use crate::data::{BotRecord, DataService, TeamRecord};

/// Directive appended to the system prompt of subscription runs: the
/// agent may exit silently when nothing is worth reporting.
const SUBSCRIPTION_DIRECTIVE: &str = "\n\n<subscription_mode>\n\
    This task runs unattended on a schedule. Work to completion without \
    asking clarifying questions. If there is nothing new or noteworthy \
    to report, finish with silent_exit set to true instead of producing \
    a filler answer.\n</subscription_mode>";

/// Model selection request, ordered by the caller.
#[derive(Debug, Clone, Default)]
pub enum ModelOverride {
    /// Follow task labels, then bot binding, then the bot default.
    #[default]
    FromLabels,
    /// Retry with an explicit override; `None` means "bot default",
    /// ignoring any label-level override.
    Forced(Option<String>),
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub message: String,
    pub attachment_ids: Vec<i64>,
    pub enable_tools: bool,
    pub enable_web_search: bool,
    pub enable_clarification: bool,
    pub enable_deep_thinking: bool,
    pub additional_skills: Vec<String>,
    pub history_limit: Option<u32>,
    pub is_subscription: bool,
    pub contexts: Vec<Value>,
    pub model_override: ModelOverride,
}

impl BuildOptions {
    pub fn for_message(message: &str) -> Self {
        Self {
            message: message.to_owned(),
            enable_tools: true,
            enable_deep_thinking: true,
            ..Default::default()
        }
    }
}

/// Parse the `additionalSkills` task label: a JSON string list,
/// validated element-wise (non-strings are dropped, not fatal).
pub fn parse_additional_skills(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Merge extra skills into a bot's list, preserving order, deduplicated.
pub fn merge_skills(base: &[String], extra: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut merged = Vec::new();
    for skill in base.iter().chain(extra.iter()) {
        if seen.insert(skill.as_str()) {
            merged.push(skill.clone());
        }
    }
    merged
}

/// Pipeline teams advance one member per assistant turn; other teams
/// always lead with the first member.
pub fn select_member_index(team: &TeamRecord, prior_assistant_turns: usize) -> usize {
    if team.members.is_empty() {
        return 0;
    }
    if team.is_pipeline() {
        prior_assistant_turns % team.members.len()
    } else {
        0
    }
}

pub struct TaskRequestBuilder {
    data: Arc<dyn DataService>,
    minter: Arc<TokenMinter>,
    codec: CredentialCodec,
    task_api_domain: String,
}

impl TaskRequestBuilder {
    pub fn new(
        data: Arc<dyn DataService>,
        minter: Arc<TokenMinter>,
        auth: &AuthConfig,
        task_api_domain: &str,
    ) -> Result<Self> {
        Ok(Self {
            data,
            minter,
            codec: CredentialCodec::new(&auth.credential_key)?,
            task_api_domain: task_api_domain.trim_end_matches('/').to_owned(),
        })
    }

    pub async fn build(
        &self,
        task: &TaskRecord,
        assistant: &Subtask,
        team: &TeamRecord,
        user: &UserRef,
        options: &BuildOptions,
    ) -> Result<ExecutionRequest> {
        if team.members.is_empty() {
            return Err(Error::Validation(format!("team {} has no members", team.id)));
        }

        let prior_turns = self
            .data
            .count_assistant_subtasks_before(task.id, assistant.message_id)
            .await?;
        let member_index = select_member_index(team, prior_turns);

        // Extra skills: task labels plus anything the caller selected.
        let mut extra_skills = task
            .label("additionalSkills")
            .map(parse_additional_skills)
            .unwrap_or_default();
        extra_skills.extend(options.additional_skills.iter().cloned());

        // Resolve every member's bot; the selected member contributes
        // the top-level system prompt and the model resolution scope.
        let mut bots = Vec::with_capacity(team.members.len());
        let mut system_prompt = None;
        let mut model_config = None;

        for (index, member) in team.members.iter().enumerate() {
            let bot = self
                .data
                .get_bot(member.bot_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("bot {}", member.bot_id)))?;

            let ghost_namespace = bot.ghost_namespace.clone().unwrap_or(bot.namespace.clone());
            let ghost = self
                .data
                .find_ghost(&bot.ghost_name, &ghost_namespace, bot.user_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("ghost {}", bot.ghost_name)))?;

            let shell_namespace = bot.shell_namespace.clone().unwrap_or(bot.namespace.clone());
            let shell = self
                .data
                .find_shell(&bot.shell_name, &shell_namespace, bot.user_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("shell {}", bot.shell_name)))?;

            let selected = index == member_index;
            let resolved_model = self.resolve_model(task, team, user, &bot, options).await?;

            let mut agent_config = bot.agent_config.clone();
            if let Some(resolved) = &resolved_model {
                agent_config = Some(resolved.clone());
                if selected {
                    model_config = Some(resolved.clone());
                }
            }

            let member_system_prompt =
                join_prompts(ghost.system_prompt.as_deref(), member.prompt.as_deref());
            if selected {
                system_prompt = member_system_prompt.clone();
            }

            bots.push(BotSpec {
                shell_type: Some(shell.shell_type.clone()),
                agent_config,
                system_prompt: member_system_prompt,
                mcp_servers: bot.mcp_servers.clone(),
                skills: merge_skills(&bot.skills, &extra_skills),
                role: member.role.clone(),
                base_image: shell.base_image.clone(),
            });
        }

        // Prompt aggregation: the user message, plus the previous
        // assistant answer as carried context.
        let mut prompt = options.message.clone();
        if let Some(previous) = self.previous_answer(task.id, assistant.message_id).await? {
            prompt = format!("{prompt}\n\n{previous}");
        }
        let mut new_session = false;

        // Stage confirmation replaces the aggregate outright.
        if let Some(metadata) = &assistant.metadata {
            let confirmed = metadata
                .get("from_stage_confirmation")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if confirmed {
                if let Some(confirmed_prompt) =
                    metadata.get("confirmed_prompt").and_then(Value::as_str)
                {
                    prompt = confirmed_prompt.to_owned();
                    new_session = true;
                }
            }
        }

        let auth_token = self.minter.mint_user_token(user)?;
        let task_token = self.minter.mint_task_token(task.id, assistant.id, user)?;

        let mut system_prompt = system_prompt;
        let mut system_mcp_config = None;
        if options.is_subscription {
            let base = system_prompt.take().unwrap_or_default();
            system_prompt = Some(format!("{base}{SUBSCRIPTION_DIRECTIVE}"));
            system_mcp_config = Some(serde_json::json!({
                "url": format!("{}/mcp", self.task_api_domain),
                "token": task_token.clone(),
            }));
        }

        let attachments = self
            .data
            .list_ready_attachments(&options.attachment_ids)
            .await?;

        let mut request = ExecutionRequest::new(task.id, assistant.id);
        request.message_id = Some(assistant.message_id);
        request.executor_name = assistant.executor_name.clone();
        request.executor_namespace = assistant.executor_namespace.clone();
        request.prompt = prompt;
        request.system_prompt = system_prompt;
        request.model_config = model_config;
        request.bot = bots;
        request.user = Some(user.clone());
        request.team_id = Some(team.id);
        request.team_namespace = Some(team.namespace.clone());
        request.team_mode = team.mode.clone();
        request.history_limit = options.history_limit;
        request.enable_tools = options.enable_tools;
        request.enable_web_search = options.enable_web_search;
        request.enable_clarification = options.enable_clarification;
        request.enable_deep_thinking = options.enable_deep_thinking;
        request.preload_skills = extra_skills;
        request.is_subscription = options.is_subscription;
        request.table_contexts = options.contexts.clone();
        request.attachments = attachments;
        request.auth_token = Some(auth_token);
        request.task_token = Some(task_token);
        request.system_mcp_config = system_mcp_config;
        request.new_session = new_session;
        request.task_type = Some(self.task_type(task, options));
        Ok(request)
    }

    fn task_type(&self, task: &TaskRecord, options: &BuildOptions) -> String {
        if options.is_subscription {
            return "subscription".into();
        }
        task.label("taskType").unwrap_or("online").to_owned()
    }

    /// Latest completed assistant answer strictly before `message_id`.
    async fn previous_answer(&self, task_id: i64, message_id: i64) -> Result<Option<String>> {
        let Some(latest) = self.data.latest_assistant_subtask(task_id).await? else {
            return Ok(None);
        };
        if latest.message_id >= message_id {
            // The latest assistant row is the one being built; scan back
            // through history instead.
            let earlier = self
                .data
                .subtasks_after(task_id, 0)
                .await?
                .into_iter()
                .filter(|s| {
                    s.message_id < message_id
                        && s.role == tm_domain::task::SubtaskRole::Assistant
                })
                .max_by_key(|s| s.message_id);
            return Ok(earlier
                .map(|s| s.result_value().to_owned())
                .filter(|v| !v.is_empty()));
        }
        Ok(Some(latest.result_value().to_owned()).filter(|v| !v.is_empty()))
    }

    /// Model override policy, in order:
    /// 1. `Forced` (retry payload) — explicit name or bot default
    /// 2. task labels `forceOverrideBotModel=true` + `modelId`, looked
    ///    up as the chat user (per-user private overrides)
    /// 3. `bot.agent_config.bind_model`, bot-owner scope
    /// 4. task-level `modelId` label, task-owner scope
    /// 5. bot default (no replacement)
    async fn resolve_model(
        &self,
        task: &TaskRecord,
        team: &TeamRecord,
        user: &UserRef,
        bot: &BotRecord,
        options: &BuildOptions,
    ) -> Result<Option<Value>> {
        // Model visibility follows the team's namespace.
        let namespace = team.namespace.clone();

        let lookup: Option<(String, i64)> = match &options.model_override {
            ModelOverride::Forced(Some(name)) => Some((name.clone(), user.id)),
            ModelOverride::Forced(None) => None,
            ModelOverride::FromLabels => {
                let forced = task.label("forceOverrideBotModel") == Some("true");
                if forced {
                    task.label("modelId").map(|name| (name.to_owned(), user.id))
                } else if let Some(bound) = bot.bind_model() {
                    Some((bound.to_owned(), bot.user_id))
                } else {
                    task.label("modelId")
                        .map(|name| (name.to_owned(), task.user_id))
                }
            }
        };

        let Some((name, scope_user)) = lookup else {
            return Ok(None);
        };
        let model = self
            .data
            .find_model(&name, &namespace, scope_user)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model {name}")))?;

        let mut config = model.model_config.clone();
        self.codec.decrypt_model_env(&mut config)?;
        Ok(Some(config))
    }
}

fn join_prompts(ghost: Option<&str>, member: Option<&str>) -> Option<String> {
    match (
        ghost.filter(|s| !s.is_empty()),
        member.filter(|s| !s.is_empty()),
    ) {
        (Some(g), Some(m)) => Some(format!("{g}\n\n{m}")),
        (Some(g), None) => Some(g.to_owned()),
        (None, Some(m)) => Some(m.to_owned()),
        (None, None) => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
