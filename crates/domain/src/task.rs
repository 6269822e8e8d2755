//! Persisted task state: the `Subtask` (one conversation turn) and the
//! `TaskRecord` whose status mirrors the latest assistant subtask.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::ResultView;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status & role
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubtaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Normal forward transitions. Same-ID retry (failed → pending) is a
    /// deliberate reset performed by the data layer, not covered here.
    pub fn can_transition_to(self, next: SubtaskStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskRole {
    User,
    Assistant,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subtask
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One turn in a conversation. `message_id` is the single monotonic
/// order inside a task; an assistant's `parent_id` is the *message_id*
/// of the triggering user subtask (load-bearing for same-ID retry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: i64,
    pub task_id: i64,
    pub message_id: i64,
    pub role: SubtaskRole,
    pub status: SubtaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_namespace: Option<String>,
    /// User turns only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Assistant turns: message_id of the triggering user subtask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bot_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    pub fn new(id: i64, task_id: i64, message_id: i64, role: SubtaskRole, user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_id,
            message_id,
            role,
            status: SubtaskStatus::Pending,
            result: None,
            progress: 0,
            error_message: None,
            executor_name: None,
            executor_namespace: None,
            prompt: None,
            parent_id: None,
            metadata: None,
            bot_ids: Vec::new(),
            team_id: None,
            user_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn result_view(&self) -> Option<ResultView<'_>> {
        self.result.as_ref().map(ResultView)
    }

    pub fn result_value(&self) -> &str {
        self.result_view().map(|v| v.value()).unwrap_or("")
    }
}

/// Partial update applied to a subtask row by the status-updating paths.
#[derive(Debug, Clone, Default)]
pub struct SubtaskPatch {
    pub status: Option<SubtaskStatus>,
    pub result: Option<Value>,
    pub progress: Option<u8>,
    pub error_message: Option<String>,
    pub executor_name: Option<String>,
    pub executor_namespace: Option<String>,
}

impl SubtaskPatch {
    pub fn status(status: SubtaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task record & status mirror
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The conversation container. Its status block is denormalised from the
/// latest assistant subtask by [`derive_task_mirror`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Metadata labels (`modelId`, `forceOverrideBotModel`,
    /// `additionalSkills`, …).
    #[serde(default)]
    pub labels: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubtaskStatus>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: i64, user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            team_id: None,
            title: None,
            labels: serde_json::Map::new(),
            status: None,
            progress: 0,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).and_then(Value::as_str)
    }
}

/// Status-mirror update derived from the latest assistant subtask.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskMirror {
    pub status: Option<SubtaskStatus>,
    pub progress: Option<u8>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub set_completed_at: bool,
}

/// Derive the task's status mirror from its latest assistant subtask.
///
/// RUNNING carries no progress override; COMPLETED pins progress to 100,
/// stamps `completed_at` and copies the result; FAILED copies the error.
pub fn derive_task_mirror(latest_assistant: &Subtask) -> TaskMirror {
    match latest_assistant.status {
        SubtaskStatus::Running => TaskMirror {
            status: Some(SubtaskStatus::Running),
            ..Default::default()
        },
        SubtaskStatus::Completed => TaskMirror {
            status: Some(SubtaskStatus::Completed),
            progress: Some(100),
            result: latest_assistant.result.clone(),
            set_completed_at: true,
            ..Default::default()
        },
        SubtaskStatus::Failed => TaskMirror {
            status: Some(SubtaskStatus::Failed),
            error_message: latest_assistant.error_message.clone(),
            ..Default::default()
        },
        other => TaskMirror {
            status: Some(other),
            ..Default::default()
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(status: SubtaskStatus) -> Subtask {
        let mut subtask = Subtask::new(7, 42, 3, SubtaskRole::Assistant, 1);
        subtask.status = status;
        subtask
    }

    #[test]
    fn status_wire_format_is_uppercase() {
        let json = serde_json::to_string(&SubtaskStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        let back: SubtaskStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(back, SubtaskStatus::Failed);
    }

    #[test]
    fn terminal_states() {
        assert!(SubtaskStatus::Completed.is_terminal());
        assert!(SubtaskStatus::Failed.is_terminal());
        assert!(SubtaskStatus::Cancelled.is_terminal());
        assert!(!SubtaskStatus::Pending.is_terminal());
        assert!(!SubtaskStatus::Running.is_terminal());
    }

    #[test]
    fn transitions() {
        use SubtaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn mirror_running_has_no_progress_override() {
        let mirror = derive_task_mirror(&assistant(SubtaskStatus::Running));
        assert_eq!(mirror.status, Some(SubtaskStatus::Running));
        assert_eq!(mirror.progress, None);
        assert!(!mirror.set_completed_at);
    }

    #[test]
    fn mirror_completed_copies_result() {
        let mut subtask = assistant(SubtaskStatus::Completed);
        subtask.result = Some(serde_json::json!({"value": "done"}));
        let mirror = derive_task_mirror(&subtask);
        assert_eq!(mirror.status, Some(SubtaskStatus::Completed));
        assert_eq!(mirror.progress, Some(100));
        assert!(mirror.set_completed_at);
        assert_eq!(
            mirror.result.as_ref().and_then(|r| r.get("value")),
            Some(&serde_json::json!("done"))
        );
    }

    #[test]
    fn mirror_failed_copies_error() {
        let mut subtask = assistant(SubtaskStatus::Failed);
        subtask.error_message = Some("image pull failed".into());
        let mirror = derive_task_mirror(&subtask);
        assert_eq!(mirror.status, Some(SubtaskStatus::Failed));
        assert_eq!(mirror.error_message.as_deref(), Some("image pull failed"));
        assert!(!mirror.set_completed_at);
    }

    #[test]
    fn subtask_result_value_accessor() {
        let mut subtask = assistant(SubtaskStatus::Completed);
        assert_eq!(subtask.result_value(), "");
        subtask.result = Some(serde_json::json!({"value": "hello"}));
        assert_eq!(subtask.result_value(), "hello");
    }

    #[test]
    fn task_label_lookup() {
        let mut task = TaskRecord::new(42, 1);
        task.labels
            .insert("modelId".into(), Value::String("gpt-x".into()));
        assert_eq!(task.label("modelId"), Some("gpt-x"));
        assert_eq!(task.label("missing"), None);
    }
}
