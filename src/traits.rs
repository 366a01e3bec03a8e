use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    ChatMessage, ConversationState, ExtractorOutput, Task, TaskDraft, TaskPatch, TaskStatus,
};

/// Turns free text into a structured task delta.
///
/// The chat engine treats this as an opaque capability: it only relies on
/// the [`ExtractorOutput`] shape and tolerates omitted optional fields.
/// Any error is caught by the engine and converted into a per-turn,
/// recoverable failure.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// `reference` is the previously created task, passed along so the
    /// extractor can flag follow-up messages as updates to it.
    async fn extract(
        &self,
        history: &[ChatMessage],
        draft: &TaskDraft,
        reference: Option<&Task>,
    ) -> anyhow::Result<ExtractorOutput>;
}

/// Task persistence boundary. The chat engine creates and updates tasks;
/// the scheduler reads due tasks and flips status/flags. Updates are scoped
/// to single rows; no cross-row transactions are required.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a draft as a new pending task. Returns the stored task.
    async fn create_task(&self, user_id: &str, draft: &TaskDraft) -> anyhow::Result<Task>;

    /// Fetch a task by id.
    async fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>>;

    /// All tasks for a user, newest first.
    async fn get_tasks(&self, user_id: &str) -> anyhow::Result<Vec<Task>>;

    /// Pending tasks whose trigger condition has passed at `now`:
    /// reminders past `trigger_time`, events past `start_time`, and any
    /// task with `remind_via_email` whose `reminder_time` has passed
    /// without `reminder_sent` being recorded.
    async fn get_due_tasks(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Task>>;

    /// Apply a partial update: title/kind only when supplied, `data`
    /// merged key-by-key into the stored payload. Returns the updated
    /// task, or None when the id is unknown.
    async fn update_task(&self, id: &str, patch: &TaskPatch) -> anyhow::Result<Option<Task>>;

    /// Transition a task's status. Returns the updated task, or None when
    /// the id is unknown.
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> anyhow::Result<Option<Task>>;

    /// Set the email-reminder flag on an existing task.
    async fn set_remind_via_email(&self, id: &str, value: bool) -> anyhow::Result<()>;

    /// Durably record that the email reminder for this task was dispatched.
    async fn set_reminder_sent(&self, id: &str) -> anyhow::Result<()>;

    /// Delete a task. Returns true when a row was removed.
    async fn delete_task(&self, id: &str) -> anyhow::Result<bool>;
}

/// Server-side conversation state, keyed by conversation id with expiry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, conversation_id: &str)
        -> anyhow::Result<Option<ConversationState>>;

    async fn save_session(
        &self,
        conversation_id: &str,
        state: &ConversationState,
    ) -> anyhow::Result<()>;

    async fn delete_session(&self, conversation_id: &str) -> anyhow::Result<()>;

    /// Drop sessions idle longer than `ttl_secs`. Returns the purge count.
    async fn purge_expired(&self, ttl_secs: i64) -> anyhow::Result<u64>;
}

/// Delivers a reminder message to a user's registered channel.
/// No retry policy is imposed here; the scheduler decides what a failed
/// send means per task kind.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, account: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}
