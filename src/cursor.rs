//! Durable resume cursor for the change feed.
//!
//! The cursor is a single row holding the last sequence token the listener
//! parsed. It is written before the corresponding change is applied, so after
//! a crash the cursor may be one event ahead of the index. Callers must
//! tolerate that; there is no transactional coupling with index mutations.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::ResumeCursor;

/// Storage for the listener's position in the change feed.
///
/// Implementations must be durable and idempotent: writing the same token
/// twice leaves the store in the same state as writing it once. The listener
/// is the only writer.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Full cursor row, including when it was last written.
    async fn get_cursor(&self) -> Result<Option<ResumeCursor>>;

    /// Overwrites the stored position.
    async fn set_last_position(&self, token: &str) -> Result<()>;

    /// The last stored sequence token, or `None` if the feed was never read.
    async fn get_last_position(&self) -> Result<Option<String>> {
        Ok(self.get_cursor().await?.map(|c| c.sequence_token))
    }
}

/// [`CursorStore`] backed by the `feed_cursor` table.
#[derive(Clone)]
pub struct SqliteCursorStore {
    pool: SqlitePool,
}

impl SqliteCursorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Forgets the stored position so the next run starts from the feed head.
    pub async fn reset(&self) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feed_cursor WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn get_cursor(&self) -> Result<Option<ResumeCursor>> {
        let row = sqlx::query("SELECT seq, updated_at FROM feed_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let updated_at: i64 = row.get("updated_at");
            ResumeCursor {
                sequence_token: row.get("seq"),
                updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
            }
        }))
    }

    async fn set_last_position(&self, token: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO feed_cursor (id, seq, updated_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET seq = excluded.seq, updated_at = excluded.updated_at
            "#,
        )
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Process-local [`CursorStore`], for tests and dry runs.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursor: Mutex<Option<ResumeCursor>>,
    history: Mutex<Vec<String>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing position, as if restored after a restart.
    pub fn with_position(token: &str) -> Self {
        let store = Self::default();
        *store.cursor.lock().unwrap_or_else(|e| e.into_inner()) = Some(ResumeCursor {
            sequence_token: token.to_string(),
            updated_at: Utc::now(),
        });
        store
    }

    /// Every token written so far, in write order.
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get_cursor(&self) -> Result<Option<ResumeCursor>> {
        Ok(self
            .cursor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn set_last_position(&self, token: &str) -> Result<()> {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = Some(ResumeCursor {
            sequence_token: token.to_string(),
            updated_at: Utc::now(),
        });
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(token.to_string());
        Ok(())
    }
}

/// `feedrag cursor show`
pub async fn run_cursor_show(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteCursorStore::new(pool.clone());
    match store.get_cursor().await? {
        Some(cursor) => {
            println!("seq: {}", cursor.sequence_token);
            println!("updated: {}", cursor.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        None => println!("No cursor stored. The listener will start from the feed head."),
    }
    pool.close().await;
    Ok(())
}

/// `feedrag cursor reset`
pub async fn run_cursor_reset(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    if SqliteCursorStore::new(pool.clone()).reset().await? {
        println!("Cursor cleared.");
    } else {
        println!("No cursor stored.");
    }
    pool.close().await;
    Ok(())
}
