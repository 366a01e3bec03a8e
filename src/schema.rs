//! Task schema registry: which fields each task kind needs, and the
//! validation rules that go beyond plain presence. Pure and synchronous —
//! never touches the extractor or the store.

use crate::types::{TaskData, TaskKind};

/// Fields that must be present in `data` before a draft can be confirmed.
pub fn required_fields(kind: TaskKind) -> &'static [&'static str] {
    match kind {
        TaskKind::Todo => &[],
        TaskKind::Event => &["start_time"],
        TaskKind::Habit => &["frequency"],
        TaskKind::Reminder => &["trigger_time"],
    }
}

/// Fields the extractor may fill but that never block confirmation.
pub fn optional_fields(kind: TaskKind) -> &'static [&'static str] {
    match kind {
        TaskKind::Todo => &["due_date", "priority", "notes"],
        TaskKind::Event => &["end_time", "location", "reminder_time", "notes"],
        TaskKind::Habit => &["time_of_day", "reminder_time", "notes"],
        TaskKind::Reminder => &["notes"],
    }
}

/// Validate `data` against the rules for `kind`. Returns user-facing error
/// strings; an empty vec means the payload is valid.
pub fn validate(kind: TaskKind, data: &TaskData) -> Vec<String> {
    let mut errors = Vec::new();

    for field in required_fields(kind) {
        if !data.has_field(field) {
            errors.push(format!("Missing required field: {}", field));
        }
    }

    if kind == TaskKind::Event {
        if let (Some(start), Some(end)) = (data.start_time, data.end_time) {
            if end <= start {
                errors.push("Event end time must be after start time".to_string());
            }
        }
    }

    errors
}

/// Required fields of `kind` not yet present in `data`.
pub fn missing_required(kind: TaskKind, data: &TaskData) -> Vec<&'static str> {
    required_fields(kind)
        .iter()
        .copied()
        .filter(|f| !data.has_field(f))
        .collect()
}
