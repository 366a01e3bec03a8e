//! End-to-end scenarios: chat turns against a real in-memory store, and
//! scheduler cycles against the same store.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::Value;

use crate::chat::{ChatPolicy, PARSE_FAILURE_REPLY};
use crate::core::turn_reply;
use crate::scheduler::ReminderScheduler;
use crate::testing::{reminder_delta, todo_delta, RecordingSink, TestHarness};
use crate::traits::TaskStore;
use crate::types::{ExtractorOutput, TaskData, TaskDraft, TaskKind, TaskStatus, TurnRequest};

// ---------------------------------------------------------------------------
// Dialogue scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reminder_flow_draft_confirm_email() {
    let h = TestHarness::new().await;
    let trigger = Utc.with_ymd_and_hms(2026, 9, 2, 15, 0, 0).unwrap();

    // Turn 1: full reminder extracted in one shot -> confirmation asked.
    h.extractor.push(reminder_delta("Call mom", trigger)).await;
    let r1 = h.turn("Remind me to call mom tomorrow at 3pm").await;
    assert!(r1.state.draft.confirmation_pending);
    assert!(r1.state.draft.missing_fields.is_empty());
    assert_eq!(r1.state.draft.kind, Some(TaskKind::Reminder));
    assert_eq!(r1.state.draft.data.trigger_time, Some(trigger));
    assert!(r1.message.contains("Shall I create it?"));
    assert!(h.store.get_tasks("u1").await.unwrap().is_empty());

    // Turn 2: "yes" persists the task and offers an email reminder.
    let r2 = h.turn("yes").await;
    assert!(r2.state.waiting_for_email_choice);
    assert!(!r2.state.complete);
    assert!(r2.message.contains("email reminder"));
    let tasks = h.store.get_tasks("u1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(tasks[0].kind, TaskKind::Reminder);
    assert!(!tasks[0].remind_via_email);
    assert_eq!(r2.state.last_created_task_id.as_deref(), Some(tasks[0].id.as_str()));

    // Turn 3: "yes" flips the email flag on the referenced task only.
    let r3 = h.turn("yes").await;
    assert!(r3.state.done);
    assert!(!r3.state.waiting_for_email_choice);
    assert!(r3.state.last_created_task_id.is_none());
    let tasks = h.store.get_tasks("u1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].remind_via_email);
}

#[tokio::test]
async fn email_choice_negative_leaves_flag_unset() {
    let h = TestHarness::new().await;
    h.extractor
        .push(reminder_delta("Stretch", Utc::now() + Duration::hours(2)))
        .await;
    h.turn("remind me to stretch in two hours").await;
    h.turn("yes").await;

    let r = h.turn("no thanks").await;
    assert!(r.state.done);
    assert!(!r.state.waiting_for_email_choice);
    let tasks = h.store.get_tasks("u1").await.unwrap();
    assert!(!tasks[0].remind_via_email);
}

#[tokio::test]
async fn clarify_loop_until_required_field_arrives() {
    let h = TestHarness::new().await;

    // Extractor knows it's a reminder but has no time yet.
    h.extractor
        .push(ExtractorOutput {
            kind: Some("reminder".to_string()),
            title: Some("Call the dentist".to_string()),
            reply: "Sure, a reminder.".to_string(),
            ..Default::default()
        })
        .await;
    let r1 = h.turn("remind me to call the dentist").await;
    assert!(!r1.state.draft.confirmation_pending);
    assert!(r1
        .state
        .draft
        .missing_fields
        .iter()
        .any(|m| m.field == "trigger_time"));
    assert!(r1.message.contains("What is the trigger time?"));
    assert!(h.store.get_tasks("u1").await.unwrap().is_empty());

    // Next turn supplies the time; title survives the sparse delta.
    let mut data = TaskData::default();
    data.trigger_time = Some(Utc.with_ymd_and_hms(2026, 9, 3, 9, 0, 0).unwrap());
    h.extractor
        .push(ExtractorOutput {
            data,
            ..Default::default()
        })
        .await;
    let r2 = h.turn("tomorrow at 9am").await;
    assert!(r2.state.draft.confirmation_pending);
    assert_eq!(r2.state.draft.title, "Call the dentist");
    assert!(r2.message.contains("Call the dentist"));
}

#[tokio::test]
async fn never_complete_while_fields_missing() {
    let h = TestHarness::new().await;
    h.extractor
        .push(ExtractorOutput {
            kind: Some("event".to_string()),
            title: Some("Team offsite".to_string()),
            ..Default::default()
        })
        .await;
    let r1 = h.turn("set up the team offsite").await;
    assert!(!r1.state.draft.confirmation_pending);

    // An affirmative cannot confirm a draft that was never pending.
    h.extractor.push(ExtractorOutput::default()).await;
    let r2 = h.turn("yes").await;
    assert!(!r2.state.complete);
    assert!(h.store.get_tasks("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn event_time_order_error_is_conversational() {
    let h = TestHarness::new().await;
    let mut data = TaskData::default();
    data.start_time = Some(Utc.with_ymd_and_hms(2026, 9, 1, 17, 0, 0).unwrap());
    data.end_time = Some(Utc.with_ymd_and_hms(2026, 9, 1, 16, 0, 0).unwrap());
    h.extractor
        .push(ExtractorOutput {
            kind: Some("event".to_string()),
            title: Some("Review".to_string()),
            data,
            ..Default::default()
        })
        .await;

    let r = h.turn("review from 5pm to 4pm").await;
    assert!(!r.state.draft.confirmation_pending);
    assert!(r.message.contains("Event end time must be after start time"));
    assert!(h.store.get_tasks("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn update_path_merges_into_existing_task() {
    let h = TestHarness::new().await;

    // Create a todo through the normal flow.
    h.extractor.push(todo_delta("Buy groceries")).await;
    h.turn("add a todo to buy groceries").await;
    h.extractor.push(ExtractorOutput::default()).await;
    let r = h.turn("yes").await;
    let created_id = r.state.last_created_task_id.clone().unwrap();

    // Seed some data so the merge has something to preserve.
    let mut patch = crate::types::TaskPatch::default();
    patch
        .data
        .extra
        .insert("notes".into(), Value::String("farmers market".into()));
    h.store.update_task(&created_id, &patch).await.unwrap();

    // Follow-up turn flagged as an update.
    let mut delta = ExtractorOutput::default();
    delta.is_update = true;
    delta
        .data
        .extra
        .insert("priority".into(), Value::String("high".into()));
    h.extractor.push(delta).await;
    let r2 = h.turn("actually make that high priority").await;

    assert!(r2.state.done);
    assert!(r2.message.contains("updated"));
    let tasks = h.store.get_tasks("u1").await.unwrap();
    assert_eq!(tasks.len(), 1, "update must not create a new task");
    assert_eq!(tasks[0].data.extra["priority"], Value::String("high".into()));
    assert_eq!(
        tasks[0].data.extra["notes"],
        Value::String("farmers market".into()),
        "merge must preserve untouched keys"
    );
}

#[tokio::test]
async fn update_intent_without_reference_falls_through_to_draft() {
    let h = TestHarness::new().await;
    let mut delta = todo_delta("Water plants");
    delta.is_update = true;
    h.extractor.push(delta).await;

    let r = h.turn("change it to water plants").await;
    // No last task to update: treated as a new draft instead.
    assert!(!r.state.done);
    assert!(r.state.draft.confirmation_pending);
}

#[tokio::test]
async fn last_task_reference_expires_after_configured_turns() {
    let h = TestHarness::with_policy(ChatPolicy {
        last_task_retention_turns: 2,
    })
    .await;

    h.extractor.push(todo_delta("Ship the report")).await;
    h.turn("todo: ship the report").await;
    h.extractor.push(ExtractorOutput::default()).await;
    let r = h.turn("yes").await;
    assert!(r.state.last_created_task_id.is_some());

    h.extractor.push(todo_delta("Unrelated thing")).await;
    let r = h.turn("also I need to do an unrelated thing").await;
    assert!(r.state.last_created_task_id.is_some());

    h.extractor.push(ExtractorOutput::default()).await;
    let r = h.turn("hmm let me think").await;
    assert!(r.state.last_created_task_id.is_none());
}

#[tokio::test]
async fn extractor_failure_is_recoverable() {
    let h = TestHarness::new().await;
    h.extractor.push_error("model returned garbage").await;

    let r1 = h.turn("remind me about the thing").await;
    assert_eq!(r1.message, PARSE_FAILURE_REPLY);
    assert_eq!(r1.state.error.as_deref(), Some(PARSE_FAILURE_REPLY));
    assert!(r1
        .state
        .draft
        .validation_errors
        .iter()
        .any(|e| e.contains("model returned garbage")));
    assert!(h.store.get_tasks("u1").await.unwrap().is_empty());

    // Next turn starts clean and succeeds.
    h.extractor
        .push(reminder_delta("The thing", Utc::now() + Duration::hours(1)))
        .await;
    let r2 = h.turn("remind me about the thing at noon").await;
    assert!(r2.state.error.is_none());
    assert!(r2.state.draft.confirmation_pending);
}

#[tokio::test]
async fn email_and_complete_flags_never_coexist() {
    let h = TestHarness::new().await;
    h.extractor
        .push(reminder_delta("Check oven", Utc::now() + Duration::minutes(30)))
        .await;
    let r1 = h.turn("remind me to check the oven").await;
    assert!(!(r1.state.complete && r1.state.waiting_for_email_choice));
    let r2 = h.turn("yes").await;
    assert!(!(r2.state.complete && r2.state.waiting_for_email_choice));
}

#[tokio::test]
async fn store_failure_mid_turn_yields_retry_reply() {
    let h = TestHarness::new().await;
    // Closing the pool makes every session/task query fail, like lock
    // contention or a full disk would.
    h.store.pool().close().await;

    let reply = turn_reply(
        &h.engine,
        &TurnRequest {
            conversation_id: "test-conv".to_string(),
            user_id: "u1".to_string(),
            message: "remind me to stretch".to_string(),
        },
    )
    .await;
    assert!(reply.contains("try that again"));
}

// ---------------------------------------------------------------------------
// Scheduler scenarios
// ---------------------------------------------------------------------------

fn scheduler_with(h: &TestHarness, sink: Arc<RecordingSink>) -> ReminderScheduler {
    ReminderScheduler::new(h.store.clone(), sink, h.store.clone(), 60, 24 * 3600)
}

fn pending_draft(kind: TaskKind, data: TaskData, email: Option<bool>) -> TaskDraft {
    TaskDraft {
        kind: Some(kind),
        title: "Call mom".to_string(),
        summary: "weekly call".to_string(),
        data,
        remind_via_email: email,
        ..Default::default()
    }
}

#[tokio::test]
async fn due_todo_sends_once_and_stays_pending() {
    let h = TestHarness::new().await;
    let sink = RecordingSink::new();
    let scheduler = scheduler_with(&h, sink.clone());

    let now = Utc::now();
    let mut data = TaskData::default();
    data.reminder_time = Some(now - Duration::minutes(5));
    let task = h
        .store
        .create_task("u1", &pending_draft(TaskKind::Todo, data, Some(true)))
        .await
        .unwrap();

    scheduler.run_cycle(now).await.unwrap();
    assert_eq!(sink.sent_count().await, 1);
    let fetched = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert!(fetched.data.reminder_sent);
    assert_eq!(fetched.status, TaskStatus::Pending);

    // Dedup across cycles: the durable flag keeps it out of the batch.
    scheduler.run_cycle(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(sink.sent_count().await, 1);
}

#[tokio::test]
async fn due_reminder_without_email_completes_silently() {
    let h = TestHarness::new().await;
    let sink = RecordingSink::new();
    let scheduler = scheduler_with(&h, sink.clone());

    let now = Utc::now();
    let mut data = TaskData::default();
    data.trigger_time = Some(now - Duration::minutes(1));
    let task = h
        .store
        .create_task("u1", &pending_draft(TaskKind::Reminder, data, None))
        .await
        .unwrap();

    scheduler.run_cycle(now).await.unwrap();
    assert_eq!(sink.sent_count().await, 0);
    let fetched = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Completed);

    // Completed reminders never reappear, however many cycles run.
    for i in 1..4 {
        scheduler.run_cycle(now + Duration::minutes(i)).await.unwrap();
    }
    assert_eq!(sink.sent_count().await, 0);
}

#[tokio::test]
async fn failed_reminder_dispatch_retries_until_delivered() {
    let h = TestHarness::new().await;
    let sink = RecordingSink::new();
    let scheduler = scheduler_with(&h, sink.clone());

    let now = Utc::now();
    let mut data = TaskData::default();
    data.trigger_time = Some(now - Duration::minutes(1));
    let task = h
        .store
        .create_task("u1", &pending_draft(TaskKind::Reminder, data, Some(true)))
        .await
        .unwrap();

    // Completed only after a confirmed delivery: a failed send keeps the
    // task pending for the next cycle.
    sink.set_failing(true);
    scheduler.run_cycle(now).await.unwrap();
    let fetched = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Pending);

    sink.set_failing(false);
    scheduler.run_cycle(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(sink.sent_count().await, 1);
    let fetched = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Completed);
}

#[tokio::test]
async fn started_event_completes_and_sends_due_email() {
    let h = TestHarness::new().await;
    let sink = RecordingSink::new();
    let scheduler = scheduler_with(&h, sink.clone());

    let now = Utc::now();
    let mut data = TaskData::default();
    data.start_time = Some(now - Duration::minutes(1));
    data.reminder_time = Some(now - Duration::minutes(30));
    let task = h
        .store
        .create_task("u1", &pending_draft(TaskKind::Event, data, Some(true)))
        .await
        .unwrap();

    scheduler.run_cycle(now).await.unwrap();
    assert_eq!(sink.sent_count().await, 1);
    let fetched = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Completed);

    let (account, subject, body) = sink.sent.lock().await[0].clone();
    assert_eq!(account, "u1");
    assert_eq!(subject, "Reminder: Call mom");
    assert!(body.contains("weekly call"));
}

#[tokio::test]
async fn failed_email_reminder_is_retried_next_cycle() {
    let h = TestHarness::new().await;
    let sink = RecordingSink::new();
    let scheduler = scheduler_with(&h, sink.clone());

    let now = Utc::now();
    let mut data = TaskData::default();
    data.reminder_time = Some(now - Duration::minutes(5));
    let task = h
        .store
        .create_task("u1", &pending_draft(TaskKind::Habit, data, Some(true)))
        .await
        .unwrap();

    sink.set_failing(true);
    scheduler.run_cycle(now).await.unwrap();
    let fetched = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert!(!fetched.data.reminder_sent, "flag only after confirmed send");

    sink.set_failing(false);
    scheduler.run_cycle(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(sink.sent_count().await, 1);
    let fetched = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert!(fetched.data.reminder_sent);
}
