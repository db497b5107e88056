use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{MessageId, ThreadKey, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A text send captured while the client was offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedSend {
    pub message_id: MessageId,
    pub thread: ThreadKey,
    pub sender_id: UserId,
    pub content: String,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyQueued,
    PreviouslyDropped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadPreferences {
    pub pinned: HashSet<ThreadKey>,
    pub favorites: HashSet<ThreadKey>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn enqueue_send(&self, entry: &QueuedSend) -> Result<EnqueueOutcome> {
        let dropped: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM offline_queue_dropped WHERE message_id = ?")
                .bind(entry.message_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        if dropped.is_some() {
            return Ok(EnqueueOutcome::PreviouslyDropped);
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO offline_queue (message_id, thread_kind, thread_id, sender_id, content, retry_count, enqueued_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.message_id.as_str())
        .bind(entry.thread.kind_str())
        .bind(entry.thread.id_str())
        .bind(entry.sender_id.as_str())
        .bind(&entry.content)
        .bind(i64::from(entry.retry_count))
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(EnqueueOutcome::AlreadyQueued);
        }
        debug!(message_id = %entry.message_id, thread = %entry.thread, "offline queue: stored send");
        Ok(EnqueueOutcome::Queued)
    }

    /// Sends queued by `sender_id`, oldest first.
    pub async fn queued_sends(&self, sender_id: &UserId) -> Result<Vec<QueuedSend>> {
        let rows = sqlx::query(
            "SELECT message_id, thread_kind, thread_id, sender_id, content, retry_count, enqueued_at
             FROM offline_queue
             WHERE sender_id = ?
             ORDER BY seq ASC",
        )
        .bind(sender_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queued_send_from_row).collect()
    }

    pub async fn queue_len(&self, sender_id: &UserId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offline_queue WHERE sender_id = ?")
            .bind(sender_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Bumps the retry counter and returns the new value.
    pub async fn record_send_failure(&self, message_id: &MessageId) -> Result<u32> {
        let row = sqlx::query(
            "UPDATE offline_queue SET retry_count = retry_count + 1 WHERE message_id = ? RETURNING retry_count",
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("queued send {message_id} not found"))?;
        let retry_count: i64 = row.try_get(0)?;
        Ok(u32::try_from(retry_count).unwrap_or(u32::MAX))
    }

    pub async fn remove_queued_send(&self, message_id: &MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM offline_queue WHERE message_id = ?")
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes the entry and remembers its id so it can never be queued again.
    pub async fn drop_queued_send(&self, message_id: &MessageId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM offline_queue WHERE message_id = ?")
            .bind(message_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO offline_queue_dropped (message_id, dropped_at) VALUES (?, ?)",
        )
        .bind(message_id.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn thread_preferences(&self, user_id: &UserId) -> Result<ThreadPreferences> {
        let rows = sqlx::query(
            "SELECT thread_kind, thread_id, pinned, favorite FROM thread_preferences WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut prefs = ThreadPreferences::default();
        for row in rows {
            let thread = thread_from_row(&row, 0, 1)?;
            if row.try_get::<bool, _>(2)? {
                prefs.pinned.insert(thread.clone());
            }
            if row.try_get::<bool, _>(3)? {
                prefs.favorites.insert(thread);
            }
        }
        Ok(prefs)
    }

    pub async fn set_pinned(&self, user_id: &UserId, thread: &ThreadKey, pinned: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO thread_preferences (user_id, thread_kind, thread_id, pinned)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, thread_kind, thread_id) DO UPDATE SET pinned = excluded.pinned",
        )
        .bind(user_id.as_str())
        .bind(thread.kind_str())
        .bind(thread.id_str())
        .bind(pinned)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_favorite(
        &self,
        user_id: &UserId,
        thread: &ThreadKey,
        favorite: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO thread_preferences (user_id, thread_kind, thread_id, favorite)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, thread_kind, thread_id) DO UPDATE SET favorite = excluded.favorite",
        )
        .bind(user_id.as_str())
        .bind(thread.kind_str())
        .bind(thread.id_str())
        .bind(favorite)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_tombstone(
        &self,
        user_id: &UserId,
        thread: &ThreadKey,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO thread_tombstones (user_id, thread_kind, thread_id, deleted_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, thread_kind, thread_id) DO UPDATE SET deleted_at = excluded.deleted_at",
        )
        .bind(user_id.as_str())
        .bind(thread.kind_str())
        .bind(thread.id_str())
        .bind(deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tombstones(&self, user_id: &UserId) -> Result<HashMap<ThreadKey, DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT thread_kind, thread_id, deleted_at FROM thread_tombstones WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(ThreadKey, DateTime<Utc>)> {
                Ok((thread_from_row(row, 0, 1)?, row.try_get(2)?))
            })
            .collect()
    }

    pub async fn purge_tombstones_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM thread_tombstones WHERE deleted_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn thread_from_row(row: &SqliteRow, kind_idx: usize, id_idx: usize) -> Result<ThreadKey> {
    let kind: String = row.try_get(kind_idx)?;
    let id: String = row.try_get(id_idx)?;
    ThreadKey::from_parts(&kind, &id).ok_or_else(|| anyhow!("unknown thread kind '{kind}'"))
}

fn queued_send_from_row(row: &SqliteRow) -> Result<QueuedSend> {
    let retry_count: i64 = row.try_get(5)?;
    Ok(QueuedSend {
        message_id: MessageId(row.try_get::<String, _>(0)?),
        thread: thread_from_row(row, 1, 2)?,
        sender_id: UserId(row.try_get::<String, _>(3)?),
        content: row.try_get(4)?,
        retry_count: u32::try_from(retry_count).unwrap_or_default(),
        enqueued_at: row.try_get(6)?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
