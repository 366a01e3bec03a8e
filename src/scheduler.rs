//! Due-task scheduler: a single background loop that polls the task store,
//! dispatches reminder notifications, and transitions task status.
//!
//! Delivery is at-least-once. For non-reminder kinds the durable
//! `reminder_sent` flag is the dedup marker; a crash between dispatch and
//! flag write can duplicate one send on the next cycle. Reminder-kind tasks
//! complete only after a confirmed delivery (or immediately when no
//! delivery is owed), so a failed send stays pending and retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::traits::{NotificationSink, SessionStore, TaskStore};
use crate::types::{Task, TaskKind, TaskStatus};

pub struct ReminderScheduler {
    tasks: Arc<dyn TaskStore>,
    sink: Arc<dyn NotificationSink>,
    sessions: Arc<dyn SessionStore>,
    poll_interval: Duration,
    session_ttl_secs: i64,
    /// Advisory re-entrancy guard: a cycle that is still running when the
    /// timer fires again causes the new cycle to be skipped entirely.
    /// In-process only; running multiple scheduler instances against one
    /// database is not supported.
    running: AtomicBool,
}

impl ReminderScheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        sink: Arc<dyn NotificationSink>,
        sessions: Arc<dyn SessionStore>,
        poll_interval_secs: u64,
        session_ttl_secs: i64,
    ) -> Self {
        Self {
            tasks,
            sink,
            sessions,
            poll_interval: Duration::from_secs(poll_interval_secs),
            session_ttl_secs,
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the poll loop as a background task. Cancelling the token stops
    /// the loop after any in-flight cycle finishes.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        info!(interval_secs = self.poll_interval.as_secs(), "Scheduler started");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.cancelled() => {
                        info!("Scheduler stopped");
                        return;
                    }
                }

                if self
                    .running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    warn!("Previous scheduler cycle still running, skipping this tick");
                    continue;
                }
                if let Err(e) = self.run_cycle(Utc::now()).await {
                    error!("Scheduler cycle failed: {:#}", e);
                }
                self.running.store(false, Ordering::SeqCst);
            }
        })
    }

    /// One poll cycle: classify due tasks and process them sequentially so
    /// writes to any one task stay ordered.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let due = self.tasks.get_due_tasks(now).await?;
        if !due.is_empty() {
            info!(count = due.len(), "Processing due tasks");
        }

        for task in due {
            if let Err(e) = self.process_task(&task, now).await {
                // A store failure on one task must not abort the batch.
                error!(task_id = %task.id, "Failed to process due task: {:#}", e);
            }
        }

        match self.sessions.purge_expired(self.session_ttl_secs).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Purged expired conversation sessions"),
            Err(e) => warn!("Session purge failed: {:#}", e),
        }

        Ok(())
    }

    async fn process_task(&self, task: &Task, now: DateTime<Utc>) -> anyhow::Result<()> {
        match task.kind {
            TaskKind::Reminder => self.process_reminder(task).await,
            _ => {
                // Email reminder first, then event completion: an event can
                // owe both on the same cycle.
                if email_reminder_due(task, now) {
                    self.dispatch_email_reminder(task).await?;
                }
                if task.kind == TaskKind::Event && start_due(task, now) {
                    self.complete(task).await?;
                }
                Ok(())
            }
        }
    }

    /// A reminder-kind task fires once. When an email is owed it completes
    /// only after the send succeeds; a failed send leaves it pending for
    /// the next cycle.
    async fn process_reminder(&self, task: &Task) -> anyhow::Result<()> {
        if task.remind_via_email {
            if let Err(e) = self.dispatch(task).await {
                warn!(task_id = %task.id, "Reminder dispatch failed, will retry next cycle: {:#}", e);
                return Ok(());
            }
        }
        self.complete(task).await
    }

    /// Non-reminder email path: send, then durably record `reminder_sent`
    /// so the due predicate stops selecting the task. Status stays pending.
    async fn dispatch_email_reminder(&self, task: &Task) -> anyhow::Result<()> {
        if let Err(e) = self.dispatch(task).await {
            warn!(task_id = %task.id, "Email reminder dispatch failed, will retry next cycle: {:#}", e);
            return Ok(());
        }
        self.tasks.set_reminder_sent(&task.id).await?;
        info!(task_id = %task.id, "Email reminder sent");
        Ok(())
    }

    async fn dispatch(&self, task: &Task) -> anyhow::Result<()> {
        let subject = format!("Reminder: {}", task.title);
        let when = task
            .data
            .trigger_time
            .or(task.data.start_time)
            .or(task.data.reminder_time);
        let mut body = String::new();
        if !task.summary.is_empty() {
            body.push_str(&task.summary);
            body.push('\n');
        }
        if let Some(when) = when {
            body.push_str(&format!("Scheduled for {}", when.format("%Y-%m-%d %H:%M UTC")));
        }
        self.sink.send(&task.user_id, &subject, &body).await
    }

    async fn complete(&self, task: &Task) -> anyhow::Result<()> {
        self.tasks
            .update_task_status(&task.id, TaskStatus::Completed)
            .await?;
        info!(task_id = %task.id, kind = %task.kind, "Task completed");
        Ok(())
    }
}

fn email_reminder_due(task: &Task, now: DateTime<Utc>) -> bool {
    task.remind_via_email
        && !task.data.reminder_sent
        && task.data.reminder_time.is_some_and(|t| t <= now)
}

fn start_due(task: &Task, now: DateTime<Utc>) -> bool {
    task.data.start_time.is_some_and(|t| t <= now)
}
