//! Chat transcript persistence.
//!
//! Every `/prompt` request logs the latest user turn before streaming, and
//! the assistant's full reply once the stream ends. Turns within a chat are
//! numbered from 1; `(chat_id, seq)` is unique.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{ChatMessage, Role};

#[derive(Clone)]
pub struct ChatLogger {
    pool: SqlitePool,
}

impl ChatLogger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the given chat id, or a fresh one.
    pub fn ensure_chat_id(&self, chat_id: Option<Uuid>) -> Uuid {
        chat_id.unwrap_or_else(Uuid::new_v4)
    }

    /// `max(seq) + 1` for the chat, or 1 for a new chat.
    pub async fn next_sequence(&self, chat_id: Uuid) -> Result<i64> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM chat_messages WHERE chat_id = ?")
                .bind(chat_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(last.unwrap_or(0) + 1)
    }

    pub async fn log_message(
        &self,
        chat_id: Uuid,
        role: Role,
        seq: i64,
        content: &str,
        context_slugs: Option<&[String]>,
    ) -> Result<()> {
        let slugs = context_slugs
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode context slugs")?;

        sqlx::query(
            r#"
            INSERT INTO chat_messages (chat_id, seq, role, content, context_slugs, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chat_id.to_string())
        .bind(seq)
        .bind(role.as_str())
        .bind(content)
        .bind(slugs)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to log {} message {} for chat {}", role.as_str(), seq, chat_id))?;

        Ok(())
    }

    /// All turns of a chat in order.
    pub async fn history(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT seq, role, content, context_slugs, created_at FROM chat_messages WHERE chat_id = ? ORDER BY seq",
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role = match row.get::<String, _>("role").as_str() {
                    "assistant" => Role::Assistant,
                    _ => Role::User,
                };
                let slugs: Option<String> = row.get("context_slugs");
                let context_slugs = slugs
                    .map(|s| serde_json::from_str::<Vec<String>>(&s))
                    .transpose()
                    .context("Invalid context_slugs column")?;
                let created_at: i64 = row.get("created_at");
                Ok(ChatMessage {
                    chat_id,
                    seq: row.get("seq"),
                    role,
                    content: row.get("content"),
                    context_slugs,
                    created_at: Utc
                        .timestamp_opt(created_at, 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }
}
