use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of task a user can create through conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Todo,
    Event,
    Habit,
    Reminder,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Todo => "todo",
            TaskKind::Event => "event",
            TaskKind::Habit => "habit",
            TaskKind::Reminder => "reminder",
        }
    }

    /// Parse a kind string. The error message is surfaced to users as a
    /// validation error, so it names the offending value.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.trim().to_lowercase().as_str() {
            "todo" => Ok(TaskKind::Todo),
            "event" => Ok(TaskKind::Event),
            "habit" => Ok(TaskKind::Habit),
            "reminder" => Ok(TaskKind::Reminder),
            other => Err(format!("Unknown task type '{}'", other)),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted task status. Only pending→completed (scheduler) and
/// pending→cancelled (user delete) transitions exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("Unknown task status '{}'", other)),
        }
    }
}

/// Structured task payload. Scheduling fields are typed; anything else the
/// extractor produces (location, priority, frequency, notes, ...) lands in
/// `extra`, which serializes flattened so the stored JSON stays a single
/// flat object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskData {
    /// When a reminder-kind task fires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<DateTime<Utc>>,
    /// Event start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// Event end. Must be strictly after `start_time`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// When an email reminder is due, for any kind with `remind_via_email`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminder_time: Option<DateTime<Utc>>,
    /// Idempotency marker: set after a non-reminder email dispatch succeeds.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reminder_sent: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskData {
    /// Shallow key-by-key merge; values present in `delta` win.
    /// `reminder_sent` is scheduler-owned and never merged from a delta.
    pub fn merge_from(&mut self, delta: &TaskData) {
        if delta.trigger_time.is_some() {
            self.trigger_time = delta.trigger_time;
        }
        if delta.start_time.is_some() {
            self.start_time = delta.start_time;
        }
        if delta.end_time.is_some() {
            self.end_time = delta.end_time;
        }
        if delta.reminder_time.is_some() {
            self.reminder_time = delta.reminder_time;
        }
        for (k, v) in &delta.extra {
            self.extra.insert(k.clone(), v.clone());
        }
    }

    /// Whether a schema field is present, by name. Typed fields first,
    /// then the escape-hatch map (null counts as absent).
    pub fn has_field(&self, field: &str) -> bool {
        match field {
            "trigger_time" => self.trigger_time.is_some(),
            "start_time" => self.start_time.is_some(),
            "end_time" => self.end_time.is_some(),
            "reminder_time" => self.reminder_time.is_some(),
            other => self.extra.get(other).is_some_and(|v| !v.is_null()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trigger_time.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.reminder_time.is_none()
            && !self.reminder_sent
            && self.extra.is_empty()
    }
}

/// A persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub summary: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub data: TaskData,
    pub remind_via_email: bool,
    pub created_at: DateTime<Utc>,
}

/// Partial update applied to an existing task by the explicit update path.
/// `data` is merged into the stored data, not substituted.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub kind: Option<TaskKind>,
    pub data: TaskData,
}

/// A required field the extractor could not fill, with the question to ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingField {
    pub field: String,
    #[serde(default)]
    pub reason: String,
    /// Question to render in the clarify step. Empty falls back to
    /// "What is the {field}?".
    #[serde(default)]
    pub question: String,
}

/// The in-progress, unpersisted task being assembled across turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub kind: Option<TaskKind>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub data: TaskData,
    #[serde(default)]
    pub missing_fields: Vec<MissingField>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub confirmation_pending: bool,
    /// None until the user answers the email follow-up (or never, for
    /// non-reminder kinds where the extractor may set it directly).
    pub remind_via_email: Option<bool>,
}

/// One utterance in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "user" | "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

/// Per-conversation state, held server-side in the session store and
/// round-tripped in turn responses for observability only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub draft: TaskDraft,
    /// Weak reference to the most recently created task: id only.
    pub last_created_task_id: Option<String>,
    #[serde(default)]
    pub waiting_for_email_choice: bool,
    /// One-turn pulse: the draft is ready to persist.
    #[serde(default)]
    pub complete: bool,
    /// One-turn pulse: this turn's branch is terminal.
    #[serde(default)]
    pub done: bool,
    pub error: Option<String>,
    /// Non-update turns since the last task was created. Drives the
    /// configurable policy that clears `last_created_task_id`.
    #[serde(default)]
    pub turns_since_create: u32,
}

/// What a caller submits for one conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub user_id: String,
    pub message: String,
}

/// One turn's result: the assistant message to render plus the updated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub message: String,
    pub state: ConversationState,
}

/// Structured delta returned by the extractor for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractorOutput {
    /// Task kind as a string so unknown values surface as validation
    /// errors instead of parse failures.
    pub kind: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub data: TaskData,
    #[serde(default)]
    pub is_update: bool,
    /// Short conversational acknowledgement to prefix clarifying questions.
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub missing_fields: Vec<MissingField>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}
