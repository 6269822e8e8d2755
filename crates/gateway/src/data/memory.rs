//! In-memory `DataService`.
//!
//! Drives the test suite and serves as the executable specification of
//! the store semantics: monotonic message ids, the assistant → task
//! status mirror, namespace visibility, and same-ID retry resets.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use tm_domain::request::{AttachmentRef, UserRef};
use tm_domain::task::{derive_task_mirror, SubtaskPatch, SubtaskRole, SubtaskStatus, TaskMirror, TaskRecord};
use tm_domain::{Error, Result, Subtask};

use super::{
    resolve_visible, BotRecord, DataService, GhostRecord, ModelRecord, NewSubtask, ShellRecord,
    TeamRecord,
};

#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub id: i64,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size: u64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRow {
    pub status: String,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Default)]
struct Inner {
    subtasks: HashMap<i64, Subtask>,
    tasks: HashMap<i64, TaskRecord>,
    task_access: HashMap<i64, HashSet<i64>>,
    teams: HashMap<i64, TeamRecord>,
    bots: HashMap<i64, BotRecord>,
    ghosts: Vec<GhostRecord>,
    shells: Vec<ShellRecord>,
    models: Vec<ModelRecord>,
    users: HashMap<i64, UserRef>,
    attachments: HashMap<i64, AttachmentRow>,
    executions: HashMap<i64, ExecutionRow>,
    next_subtask_id: i64,
    next_task_id: i64,
}

#[derive(Default)]
pub struct MemoryDataService {
    inner: RwLock<Inner>,
}

impl MemoryDataService {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_subtask_id: 1,
                next_task_id: 1,
                ..Default::default()
            }),
        }
    }

    // ── Seeding (tests and fixtures) ────────────────────────────────

    pub fn add_user(&self, user: UserRef) {
        self.inner.write().users.insert(user.id, user);
    }

    pub fn add_team(&self, team: TeamRecord) {
        self.inner.write().teams.insert(team.id, team);
    }

    pub fn add_bot(&self, bot: BotRecord) {
        self.inner.write().bots.insert(bot.id, bot);
    }

    pub fn add_ghost(&self, ghost: GhostRecord) {
        self.inner.write().ghosts.push(ghost);
    }

    pub fn add_shell(&self, shell: ShellRecord) {
        self.inner.write().shells.push(shell);
    }

    pub fn add_model(&self, model: ModelRecord) {
        self.inner.write().models.push(model);
    }

    pub fn add_attachment(&self, attachment: AttachmentRow) {
        self.inner
            .write()
            .attachments
            .insert(attachment.id, attachment);
    }

    pub fn grant_access(&self, task_id: i64, user_id: i64) {
        self.inner
            .write()
            .task_access
            .entry(task_id)
            .or_default()
            .insert(user_id);
    }

    pub fn insert_subtask(&self, subtask: Subtask) {
        let mut inner = self.inner.write();
        inner.next_subtask_id = inner.next_subtask_id.max(subtask.id + 1);
        inner.subtasks.insert(subtask.id, subtask);
    }

    pub fn insert_task(&self, task: TaskRecord) {
        let mut inner = self.inner.write();
        inner.next_task_id = inner.next_task_id.max(task.id + 1);
        inner.tasks.insert(task.id, task);
    }

    pub fn execution_row(&self, execution_id: i64) -> Option<ExecutionRow> {
        self.inner.read().executions.get(&execution_id).cloned()
    }

    fn apply_mirror(inner: &mut Inner, subtask: &Subtask) {
        // Only the latest assistant turn drives the mirror.
        let latest = inner
            .subtasks
            .values()
            .filter(|s| s.task_id == subtask.task_id && s.role == SubtaskRole::Assistant)
            .max_by_key(|s| s.message_id)
            .cloned();
        let Some(latest) = latest else { return };
        if latest.id != subtask.id {
            return;
        }
        let mirror = derive_task_mirror(&latest);
        if let Some(task) = inner.tasks.get_mut(&subtask.task_id) {
            apply_mirror_to_task(task, mirror);
        }
    }
}

pub(crate) fn apply_mirror_to_task(task: &mut TaskRecord, mirror: TaskMirror) {
    if let Some(status) = mirror.status {
        task.status = Some(status);
    }
    if let Some(progress) = mirror.progress {
        task.progress = progress;
    }
    if mirror.result.is_some() {
        task.result = mirror.result;
    }
    if mirror.error_message.is_some() {
        task.error_message = mirror.error_message;
    }
    if mirror.set_completed_at {
        task.completed_at = Some(Utc::now());
    }
    task.updated_at = Utc::now();
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn get_subtask(&self, id: i64) -> Result<Option<Subtask>> {
        Ok(self.inner.read().subtasks.get(&id).cloned())
    }

    async fn create_subtask(&self, new: NewSubtask) -> Result<Subtask> {
        let mut inner = self.inner.write();
        let id = inner.next_subtask_id;
        inner.next_subtask_id += 1;

        let message_id = inner
            .subtasks
            .values()
            .filter(|s| s.task_id == new.task_id)
            .map(|s| s.message_id)
            .max()
            .unwrap_or(0)
            + 1;

        let mut subtask = Subtask::new(id, new.task_id, message_id, new.role, new.user_id);
        subtask.prompt = new.prompt;
        subtask.parent_id = new.parent_id;
        subtask.bot_ids = new.bot_ids;
        subtask.team_id = new.team_id;
        subtask.metadata = new.metadata;
        inner.subtasks.insert(id, subtask.clone());
        Ok(subtask)
    }

    async fn update_subtask(&self, id: i64, patch: SubtaskPatch) -> Result<Subtask> {
        let mut inner = self.inner.write();
        let subtask = inner
            .subtasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("subtask {id}")))?;

        if let Some(status) = patch.status {
            subtask.status = status;
            if status.is_terminal() {
                subtask.completed_at = Some(Utc::now());
            }
        }
        if let Some(result) = patch.result {
            subtask.result = Some(result);
        }
        if let Some(progress) = patch.progress {
            subtask.progress = progress;
        }
        if let Some(error) = patch.error_message {
            subtask.error_message = Some(error);
        }
        if let Some(executor_name) = patch.executor_name {
            subtask.executor_name = Some(executor_name);
        }
        if let Some(executor_namespace) = patch.executor_namespace {
            subtask.executor_namespace = Some(executor_namespace);
        }
        subtask.updated_at = Utc::now();

        let updated = subtask.clone();
        if updated.role == SubtaskRole::Assistant {
            MemoryDataService::apply_mirror(&mut inner, &updated);
        }
        Ok(updated)
    }

    async fn reset_subtask_for_retry(&self, id: i64) -> Result<Subtask> {
        let mut inner = self.inner.write();
        let subtask = inner
            .subtasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("subtask {id}")))?;
        subtask.status = SubtaskStatus::Pending;
        subtask.result = None;
        subtask.error_message = None;
        subtask.progress = 0;
        subtask.completed_at = None;
        subtask.updated_at = Utc::now();
        Ok(subtask.clone())
    }

    async fn latest_assistant_subtask(&self, task_id: i64) -> Result<Option<Subtask>> {
        Ok(self
            .inner
            .read()
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.role == SubtaskRole::Assistant)
            .max_by_key(|s| s.message_id)
            .cloned())
    }

    async fn running_assistant_subtask(&self, task_id: i64) -> Result<Option<Subtask>> {
        Ok(self
            .inner
            .read()
            .subtasks
            .values()
            .find(|s| {
                s.task_id == task_id
                    && s.role == SubtaskRole::Assistant
                    && s.status == SubtaskStatus::Running
            })
            .cloned())
    }

    async fn subtasks_after(&self, task_id: i64, after_message_id: i64) -> Result<Vec<Subtask>> {
        let mut rows: Vec<Subtask> = self
            .inner
            .read()
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.message_id > after_message_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.message_id);
        Ok(rows)
    }

    async fn find_user_subtask_by_message(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<Option<Subtask>> {
        Ok(self
            .inner
            .read()
            .subtasks
            .values()
            .find(|s| {
                s.task_id == task_id
                    && s.message_id == message_id
                    && s.role == SubtaskRole::User
            })
            .cloned())
    }

    async fn count_assistant_subtasks_before(
        &self,
        task_id: i64,
        message_id: i64,
    ) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .subtasks
            .values()
            .filter(|s| {
                s.task_id == task_id
                    && s.role == SubtaskRole::Assistant
                    && s.message_id < message_id
            })
            .count())
    }

    async fn find_running_subtasks_by_executor(
        &self,
        executor_name: &str,
    ) -> Result<Vec<Subtask>> {
        Ok(self
            .inner
            .read()
            .subtasks
            .values()
            .filter(|s| {
                s.executor_name.as_deref() == Some(executor_name)
                    && s.status == SubtaskStatus::Running
            })
            .cloned()
            .collect())
    }

    async fn list_pending_assistant_subtasks(
        &self,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<Subtask>> {
        let inner = self.inner.read();
        let mut rows: Vec<Subtask> = inner
            .subtasks
            .values()
            .filter(|s| s.role == SubtaskRole::Assistant && s.status == SubtaskStatus::Pending)
            .filter(|s| {
                let wanted_offline = task_type == "offline";
                let is_offline = inner
                    .tasks
                    .get(&s.task_id)
                    .and_then(|t| t.label("taskType"))
                    .map(|v| v == "offline")
                    .unwrap_or(false);
                wanted_offline == is_offline
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.task_id, s.message_id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        Ok(self.inner.read().tasks.get(&id).cloned())
    }

    async fn create_task(
        &self,
        user_id: i64,
        team_id: Option<i64>,
        title: Option<String>,
        labels: serde_json::Map<String, Value>,
    ) -> Result<TaskRecord> {
        let mut inner = self.inner.write();
        let id = inner.next_task_id;
        inner.next_task_id += 1;
        let mut task = TaskRecord::new(id, user_id);
        task.team_id = team_id;
        task.title = title;
        task.labels = labels;
        inner.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn update_task_mirror(&self, task_id: i64, mirror: TaskMirror) -> Result<()> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        apply_mirror_to_task(task, mirror);
        Ok(())
    }

    async fn can_access_task(&self, task_id: i64, user_id: i64) -> Result<bool> {
        let inner = self.inner.read();
        let Some(task) = inner.tasks.get(&task_id) else {
            return Ok(false);
        };
        if task.user_id == user_id {
            return Ok(true);
        }
        Ok(inner
            .task_access
            .get(&task_id)
            .map(|users| users.contains(&user_id))
            .unwrap_or(false))
    }

    async fn get_team(&self, id: i64) -> Result<Option<TeamRecord>> {
        Ok(self.inner.read().teams.get(&id).cloned())
    }

    async fn get_bot(&self, id: i64) -> Result<Option<BotRecord>> {
        Ok(self.inner.read().bots.get(&id).cloned())
    }

    async fn find_ghost(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<GhostRecord>> {
        let inner = self.inner.read();
        let named: Vec<GhostRecord> = inner
            .ghosts
            .iter()
            .filter(|g| g.name == name)
            .cloned()
            .collect();
        Ok(resolve_visible(&named, namespace, owner_id, |g| g.namespace.as_str(), |g| g.user_id).cloned())
    }

    async fn find_shell(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<ShellRecord>> {
        let inner = self.inner.read();
        let named: Vec<ShellRecord> = inner
            .shells
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect();
        Ok(resolve_visible(&named, namespace, owner_id, |s| s.namespace.as_str(), |s| s.user_id).cloned())
    }

    async fn find_model(
        &self,
        name: &str,
        namespace: &str,
        owner_id: i64,
    ) -> Result<Option<ModelRecord>> {
        let inner = self.inner.read();
        let named: Vec<ModelRecord> = inner
            .models
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect();
        Ok(resolve_visible(&named, namespace, owner_id, |m| m.namespace.as_str(), |m| m.user_id).cloned())
    }

    async fn get_user(&self, id: i64) -> Result<Option<UserRef>> {
        Ok(self.inner.read().users.get(&id).cloned())
    }

    async fn list_ready_attachments(&self, ids: &[i64]) -> Result<Vec<AttachmentRef>> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| inner.attachments.get(id))
            .filter(|a| a.status == "READY")
            .map(|a| AttachmentRef {
                id: a.id,
                filename: a.filename.clone(),
                mime_type: a.mime_type.clone(),
                size: a.size,
            })
            .collect())
    }

    async fn update_background_execution(
        &self,
        execution_id: i64,
        status: &str,
        result_summary: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.inner.write().executions.insert(
            execution_id,
            ExecutionRow {
                status: status.to_owned(),
                result_summary: result_summary.map(String::from),
                error_message: error_message.map(String::from),
            },
        );
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
