use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::SqliteStore;
use crate::traits::TaskStore;
use crate::types::{Task, TaskDraft, TaskKind, TaskPatch, TaskStatus};

fn row_to_task(row: &SqliteRow) -> anyhow::Result<Task> {
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");
    let data_json: String = row.get("data");
    let created_at_str: String = row.get("created_at");

    Ok(Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        summary: row.get("summary"),
        kind: TaskKind::parse(&kind_str).map_err(|e| anyhow::anyhow!(e))?,
        status: TaskStatus::parse(&status_str).map_err(|e| anyhow::anyhow!(e))?,
        data: serde_json::from_str(&data_json)?,
        remind_via_email: row.get::<i64, _>("remind_via_email") != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc),
    })
}

const TASK_COLUMNS: &str =
    "id, user_id, title, summary, kind, status, data, remind_via_email, created_at";

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, user_id: &str, draft: &TaskDraft) -> anyhow::Result<Task> {
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: draft.title.clone(),
            summary: draft.summary.clone(),
            kind: draft.kind.unwrap_or(TaskKind::Todo),
            status: TaskStatus::Pending,
            data: draft.data.clone(),
            remind_via_email: draft.remind_via_email.unwrap_or(false),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO tasks (id, user_id, title, summary, kind, status, data, remind_via_email, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(&task.title)
        .bind(&task.summary)
        .bind(task.kind.as_str())
        .bind(task.status.as_str())
        .bind(serde_json::to_string(&task.data)?)
        .bind(task.remind_via_email as i64)
        .bind(task.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(task)
    }

    async fn get_task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn get_tasks(&self, user_id: &str) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE user_id = ? ORDER BY created_at DESC",
            TASK_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn get_due_tasks(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Task>> {
        let now_str = now.to_rfc3339();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks
             WHERE status = 'pending' AND (
               (kind = 'reminder'
                  AND json_extract(data, '$.trigger_time') IS NOT NULL
                  AND datetime(json_extract(data, '$.trigger_time')) <= datetime(?1))
               OR (kind = 'event'
                  AND json_extract(data, '$.start_time') IS NOT NULL
                  AND datetime(json_extract(data, '$.start_time')) <= datetime(?1))
               OR (remind_via_email = 1
                  AND json_extract(data, '$.reminder_time') IS NOT NULL
                  AND datetime(json_extract(data, '$.reminder_time')) <= datetime(?1)
                  AND COALESCE(json_extract(data, '$.reminder_sent'), 0) = 0)
             )
             ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
        .bind(&now_str)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch) -> anyhow::Result<Option<Task>> {
        // One statement, merged in SQL: a concurrent scheduler write to the
        // data column (reminder_sent) cannot land between a read and a
        // write-back. Absent patch fields serialize as absent keys, so
        // json_patch leaves them untouched.
        let result = sqlx::query(
            "UPDATE tasks SET
               title = COALESCE(?, title),
               kind = COALESCE(?, kind),
               data = json_patch(data, ?)
             WHERE id = ?",
        )
        .bind(&patch.title)
        .bind(patch.kind.map(|k| k.as_str()))
        .bind(serde_json::to_string(&patch.data)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_task(id).await
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> anyhow::Result<Option<Task>> {
        let result = sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_task(id).await
    }

    async fn set_remind_via_email(&self, id: &str, value: bool) -> anyhow::Result<()> {
        sqlx::query("UPDATE tasks SET remind_via_email = ? WHERE id = ?")
            .bind(value as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_reminder_sent(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE tasks SET data = json_set(data, '$.reminder_sent', json('true')) WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
