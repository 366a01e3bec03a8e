//! Task-drafting dialogue state machine.
//!
//! One `handle_turn` call processes one user utterance: load the
//! conversation session, route through the email-choice / update / draft
//! branches, and save the session back. The engine holds no turn-spanning
//! memory of its own; the session store is the only state between turns.

use std::sync::Arc;

use tracing::{info, warn};

use crate::schema;
use crate::traits::{Extractor, SessionStore, TaskStore};
use crate::types::{
    ChatMessage, ConversationState, ExtractorOutput, TaskDraft, TaskKind, TaskPatch, TurnRequest,
    TurnResponse,
};

/// User-facing reply when the extractor fails. The raw error lands in the
/// draft's validation errors; nothing is persisted, so the next turn starts
/// clean.
pub const PARSE_FAILURE_REPLY: &str =
    "Failed to parse task details. Please try rephrasing your request.";

/// Fixed acknowledgement for the follow-up update path.
const UPDATE_ACK: &str = "Got it, I've updated that task for you.";

/// Containment-matched affirmatives for the email-reminder follow-up.
const EMAIL_AFFIRMATIVES: [&str; 4] = ["yes", "sure", "ok", "perfect"];

/// Exact-matched affirmatives for draft confirmation.
const CONFIRM_EXACT: [&str; 4] = ["yes", "perfect", "confirm", "ok"];

/// Tunables for the dialogue engine.
#[derive(Debug, Clone)]
pub struct ChatPolicy {
    /// Clear `last_created_task_id` after this many consecutive turns with
    /// no update intent. The boundary for "unrelated new request" is
    /// deliberately a configuration knob, not a heuristic.
    pub last_task_retention_turns: u32,
}

impl Default for ChatPolicy {
    fn default() -> Self {
        Self {
            last_task_retention_turns: 3,
        }
    }
}

pub struct ChatEngine {
    extractor: Arc<dyn Extractor>,
    tasks: Arc<dyn TaskStore>,
    sessions: Arc<dyn SessionStore>,
    policy: ChatPolicy,
}

impl ChatEngine {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        tasks: Arc<dyn TaskStore>,
        sessions: Arc<dyn SessionStore>,
        policy: ChatPolicy,
    ) -> Self {
        Self {
            extractor,
            tasks,
            sessions,
            policy,
        }
    }

    /// Process one conversation turn: load session, route, save session.
    ///
    /// Extraction failures are converted into a conversational reply and do
    /// not error the turn. Store failures propagate; nothing is persisted
    /// for the turn in that case.
    pub async fn handle_turn(&self, req: &TurnRequest) -> anyhow::Result<TurnResponse> {
        let mut state = self
            .sessions
            .load_session(&req.conversation_id)
            .await?
            .unwrap_or_default();
        state.user_id = req.user_id.clone();
        state.history.push(ChatMessage::user(&req.message));

        // One-turn pulses from the previous turn are stale now.
        state.complete = false;
        state.done = false;
        state.error = None;

        let reply = if state.waiting_for_email_choice {
            self.handle_email_choice(&mut state, &req.message).await?
        } else {
            self.handle_draft_turn(&mut state, &req.message).await?
        };

        state.history.push(ChatMessage::assistant(&reply));
        self.sessions
            .save_session(&req.conversation_id, &state)
            .await?;

        Ok(TurnResponse {
            message: reply,
            state,
        })
    }

    /// Branch 1: the previous turn offered an email reminder; this turn is
    /// a yes/no answer and never reaches the extractor.
    async fn handle_email_choice(
        &self,
        state: &mut ConversationState,
        message: &str,
    ) -> anyhow::Result<String> {
        let lower = message.to_lowercase();
        let affirmative = EMAIL_AFFIRMATIVES.iter().any(|t| lower.contains(t));

        let reply = if affirmative {
            if let Some(id) = &state.last_created_task_id {
                self.tasks.set_remind_via_email(id, true).await?;
                info!(task_id = %id, "Email reminder enabled");
            }
            "Perfect, I'll email you a reminder. Anything else?".to_string()
        } else {
            "No problem, no email then. Anything else?".to_string()
        };

        state.waiting_for_email_choice = false;
        state.last_created_task_id = None;
        state.turns_since_create = 0;
        state.done = true;
        Ok(reply)
    }

    /// Branches 2+: extract a delta, then route through update / save /
    /// confirm / clarify.
    async fn handle_draft_turn(
        &self,
        state: &mut ConversationState,
        message: &str,
    ) -> anyhow::Result<String> {
        let reference = match &state.last_created_task_id {
            Some(id) => self.tasks.get_task(id).await?,
            None => None,
        };

        let delta = match self
            .extractor
            .extract(&state.history, &state.draft, reference.as_ref())
            .await
        {
            Ok(delta) => delta,
            Err(e) => {
                warn!(user_id = %state.user_id, "Extractor failed: {:#}", e);
                state.error = Some(PARSE_FAILURE_REPLY.to_string());
                state.draft.validation_errors.push(e.to_string());
                return Ok(PARSE_FAILURE_REPLY.to_string());
            }
        };

        // Update path: no clarification or confirmation loop, the delta is
        // applied to the referenced task immediately.
        if delta.is_update {
            if let Some(task) = reference {
                let patch = TaskPatch {
                    title: delta.title.clone(),
                    kind: delta.kind.as_deref().and_then(|k| TaskKind::parse(k).ok()),
                    data: delta.data.clone(),
                };
                self.tasks.update_task(&task.id, &patch).await?;
                info!(task_id = %task.id, "Task updated from follow-up turn");
                state.done = true;
                state.draft = TaskDraft::default();
                state.turns_since_create = 0;
                return Ok(UPDATE_ACK.to_string());
            }
        }

        let was_pending = state.draft.confirmation_pending;
        merge_delta(&mut state.draft, &delta);

        // Retention policy: a turn without update intent ages the weak
        // reference to the last created task.
        if state.last_created_task_id.is_some() {
            state.turns_since_create += 1;
            if state.turns_since_create >= self.policy.last_task_retention_turns {
                state.last_created_task_id = None;
                state.turns_since_create = 0;
            }
        }

        // Confirmation and save are sequential steps within this routing
        // pass, not two turns.
        if was_pending && is_confirmation(message) {
            state.complete = true;
        }
        if state.complete {
            return self.save_draft(state).await;
        }
        if state.draft.confirmation_pending {
            return Ok(render_confirm(&state.draft));
        }
        Ok(render_clarify(&state.draft, &delta))
    }

    /// Persist the draft as a new pending task and emit the creation
    /// confirmation, with the email follow-up for undecided reminders.
    async fn save_draft(&self, state: &mut ConversationState) -> anyhow::Result<String> {
        let task = self.tasks.create_task(&state.user_id, &state.draft).await?;
        info!(task_id = %task.id, kind = %task.kind, user_id = %task.user_id, "Task created");

        let mut reply = format!("Done! I've created your {} \"{}\".", task.kind, task.title);

        let offer_email =
            task.kind == TaskKind::Reminder && state.draft.remind_via_email.is_none();
        if offer_email {
            reply.push_str(" Would you also like an email reminder when it fires? (yes/no)");
            state.waiting_for_email_choice = true;
        }

        state.last_created_task_id = Some(task.id);
        state.turns_since_create = 0;
        state.draft = TaskDraft::default();
        state.complete = false;
        Ok(reply)
    }
}

/// Merge an extractor delta into the running draft.
///
/// Kind defaults to todo once unset; title/summary keep the previous value
/// when the delta omits them; data merges key-by-key with the delta
/// winning. Missing fields and validation errors are replaced by this
/// turn's findings, with the schema registry re-consulted so a sparse
/// extractor cannot skip required fields or the event time-order rule.
fn merge_delta(draft: &mut TaskDraft, delta: &ExtractorOutput) {
    let mut errors = delta.validation_errors.clone();

    if let Some(kind_str) = &delta.kind {
        match TaskKind::parse(kind_str) {
            Ok(kind) => draft.kind = Some(kind),
            Err(e) => errors.push(e),
        }
    }
    if draft.kind.is_none() {
        draft.kind = Some(TaskKind::Todo);
    }
    if let Some(title) = &delta.title {
        draft.title = title.clone();
    }
    if let Some(summary) = &delta.summary {
        draft.summary = summary.clone();
    }
    draft.data.merge_from(&delta.data);

    let kind = draft.kind.unwrap_or(TaskKind::Todo);
    let mut missing = delta.missing_fields.clone();
    for field in schema::missing_required(kind, &draft.data) {
        if !missing.iter().any(|m| m.field == field) {
            missing.push(crate::types::MissingField {
                field: field.to_string(),
                reason: "required".to_string(),
                question: String::new(),
            });
        }
    }
    for err in schema::validate(kind, &draft.data) {
        // Presence errors duplicate the missing-field list; only keep the
        // rule violations.
        if !err.starts_with("Missing required field") && !errors.contains(&err) {
            errors.push(err);
        }
    }

    draft.missing_fields = missing;
    draft.validation_errors = errors;
    draft.confirmation_pending =
        draft.missing_fields.is_empty() && draft.validation_errors.is_empty();
}

/// Exact-token or "create it" substring match for draft confirmation.
fn is_confirmation(message: &str) -> bool {
    let normalized = message
        .trim()
        .trim_end_matches(['.', '!'])
        .to_lowercase();
    CONFIRM_EXACT.contains(&normalized.as_str()) || normalized.contains("create it")
}

/// Human-readable preview of the draft, never a raw structured dump.
fn render_confirm(draft: &TaskDraft) -> String {
    let kind = draft.kind.unwrap_or(TaskKind::Todo);
    let mut lines = vec!["Here's what I have:".to_string()];
    lines.push(format!("- Title: {}", draft.title));
    lines.push(format!("- Type: {}", kind));
    if !draft.summary.is_empty() {
        lines.push(format!("- Summary: {}", draft.summary));
    }
    if let Some(t) = draft.data.trigger_time {
        lines.push(format!("- Fires at: {}", t.format("%Y-%m-%d %H:%M UTC")));
    }
    if let Some(t) = draft.data.start_time {
        lines.push(format!("- Starts: {}", t.format("%Y-%m-%d %H:%M UTC")));
    }
    if let Some(t) = draft.data.end_time {
        lines.push(format!("- Ends: {}", t.format("%Y-%m-%d %H:%M UTC")));
    }
    if let Some(t) = draft.data.reminder_time {
        lines.push(format!(
            "- Reminder at: {}",
            t.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    for (key, value) in &draft.data.extra {
        let rendered = if let Some(s) = value.as_str() {
            s.to_string()
        } else if value.is_number() || value.is_boolean() {
            value.to_string()
        } else {
            // Nested structures have no good one-line rendering.
            continue;
        };
        lines.push(format!("- {}: {}", humanize_field(key), rendered));
    }
    lines.push("Shall I create it? (yes/no)".to_string());
    lines.join("\n")
}

/// Ask for the missing fields, or rephrase validation errors as a friendly
/// follow-up when only those remain. Never persists anything.
fn render_clarify(draft: &TaskDraft, delta: &ExtractorOutput) -> String {
    if !draft.missing_fields.is_empty() {
        let opener = if delta.reply.is_empty() {
            "Got it. A few more details:".to_string()
        } else {
            delta.reply.clone()
        };
        let questions: Vec<String> = draft
            .missing_fields
            .iter()
            .map(|m| {
                if m.question.is_empty() {
                    format!("What is the {}?", humanize_field(&m.field))
                } else {
                    m.question.clone()
                }
            })
            .collect();
        return format!("{}\n{}", opener, questions.join("\n"));
    }

    if !draft.validation_errors.is_empty() {
        let cleaned: Vec<String> = draft
            .validation_errors
            .iter()
            .map(|e| strip_error_prefix(e).to_string())
            .collect();
        return format!(
            "Hmm, something doesn't look right: {}. Could you adjust that?",
            cleaned.join("; ")
        );
    }

    if delta.reply.is_empty() {
        "Okay! What would you like to do next?".to_string()
    } else {
        delta.reply.clone()
    }
}

/// Strip prefixes that make sense in logs but not in a chat reply.
fn strip_error_prefix(error: &str) -> &str {
    for prefix in ["Validation error: ", "Error: ", "error: "] {
        if let Some(rest) = error.strip_prefix(prefix) {
            return rest;
        }
    }
    error
}

/// "trigger_time" reads poorly in a question; "trigger time" is fine.
fn humanize_field(field: &str) -> String {
    field.replace('_', " ")
}
