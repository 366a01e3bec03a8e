use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::Row;

use super::SqliteStore;
use crate::traits::SessionStore;
use crate::types::ConversationState;

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load_session(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<ConversationState>> {
        let row = sqlx::query("SELECT state FROM sessions WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.get("state");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn save_session(
        &self,
        conversation_id: &str,
        state: &ConversationState,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sessions (conversation_id, user_id, state, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE SET
               user_id = excluded.user_id,
               state = excluded.state,
               updated_at = excluded.updated_at",
        )
        .bind(conversation_id)
        .bind(&state.user_id)
        .bind(serde_json::to_string(state)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, conversation_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, ttl_secs: i64) -> anyhow::Result<u64> {
        let cutoff = (Utc::now() - Duration::seconds(ttl_secs)).to_rfc3339();
        let result = sqlx::query("DELETE FROM sessions WHERE datetime(updated_at) <= datetime(?)")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
