use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{MessageId, MessageKind, ThreadId, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredThread {
    pub thread_id: ThreadId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub last_message_id: Option<MessageId>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredThread {
    pub fn participants(&self) -> [&UserId; 2] {
        [&self.participant_a, &self.participant_b]
    }

    pub fn has_participant(&self, user: &UserId) -> bool {
        &self.participant_a == user || &self.participant_b == user
    }

    pub fn other_participant(&self, user: &UserId) -> Option<&UserId> {
        if &self.participant_a == user {
            Some(&self.participant_b)
        } else if &self.participant_b == user {
            Some(&self.participant_a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: StoredMessage,
    pub receiver_unread: i64,
}

#[derive(Debug, Clone)]
pub struct ThreadOverview {
    pub thread: StoredThread,
    pub last_message: Option<StoredMessage>,
    pub unread_count: i64,
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

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Find-or-insert keyed by the deterministic thread id; concurrent
    /// first-messages between the same pair converge on one row.
    pub async fn get_or_create_thread(&self, a: &UserId, b: &UserId) -> Result<StoredThread> {
        let thread_id = ThreadId::between(a, b)?;
        let (first, second) = if a <= b { (a, b) } else { (b, a) };

        sqlx::query(
            "INSERT INTO threads (thread_id, participant_a, participant_b, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(thread_id) DO NOTHING",
        )
        .bind(thread_id.as_str())
        .bind(first.as_str())
        .bind(second.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.thread(&thread_id)
            .await?
            .context("thread row missing after upsert")
    }

    pub async fn thread(&self, thread_id: &ThreadId) -> Result<Option<StoredThread>> {
        let row = sqlx::query(
            "SELECT thread_id, participant_a, participant_b, last_message_id, last_message_at, created_at
             FROM threads WHERE thread_id = ?",
        )
        .bind(thread_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(decode_thread))
    }

    /// Insert, last-message bump and unread increment in one transaction.
    pub async fn append_message(
        &self,
        thread_id: &ThreadId,
        sender: &UserId,
        receiver: &UserId,
        body: &str,
        kind: MessageKind,
        metadata: Option<&serde_json::Value>,
    ) -> Result<AppendOutcome> {
        let expected = ThreadId::between(sender, receiver)?;
        if expected != *thread_id {
            bail!(
                "thread id {} does not match participant pair ({}, {})",
                thread_id,
                sender,
                receiver
            );
        }

        let now = Utc::now();
        let metadata_text = metadata.map(|value| value.to_string());
        let mut tx = self.pool.begin().await?;

        let message_id = sqlx::query(
            "INSERT INTO messages (thread_id, sender_id, receiver_id, body, kind, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(thread_id.as_str())
        .bind(sender.as_str())
        .bind(receiver.as_str())
        .bind(body)
        .bind(kind.as_str())
        .bind(metadata_text.as_deref())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?
        .get::<i64, _>(0);

        sqlx::query("UPDATE threads SET last_message_id = ?, last_message_at = ? WHERE thread_id = ?")
            .bind(message_id)
            .bind(now)
            .bind(thread_id.as_str())
            .execute(&mut *tx)
            .await?;

        let receiver_unread = sqlx::query(
            "INSERT INTO unread_counts (thread_id, user_id, count) VALUES (?, ?, 1)
             ON CONFLICT(thread_id, user_id) DO UPDATE SET count = count + 1
             RETURNING count",
        )
        .bind(thread_id.as_str())
        .bind(receiver.as_str())
        .fetch_one(&mut *tx)
        .await?
        .get::<i64, _>(0);

        tx.commit().await?;

        Ok(AppendOutcome {
            message: StoredMessage {
                id: MessageId(message_id),
                thread_id: thread_id.clone(),
                sender_id: sender.clone(),
                receiver_id: receiver.clone(),
                body: body.to_string(),
                kind,
                metadata: metadata.cloned(),
                created_at: now,
                read_at: None,
                edited_at: None,
            },
            receiver_unread,
        })
    }

    /// One-way read transition; the conditional UPDATE matches each unread
    /// row at most once, so the counter is decremented at most once per
    /// message even under racing reads. Returns the number transitioned.
    pub async fn mark_read(
        &self,
        thread_id: &ThreadId,
        reader: &UserId,
        message_id: Option<MessageId>,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let transitioned = match message_id {
            Some(id) => sqlx::query(
                "UPDATE messages SET read_at = ?
                 WHERE id = ? AND thread_id = ? AND receiver_id = ?
                   AND read_at IS NULL AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(id.0)
            .bind(thread_id.as_str())
            .bind(reader.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected() as i64,
            None => sqlx::query(
                "UPDATE messages SET read_at = ?
                 WHERE thread_id = ? AND receiver_id = ?
                   AND read_at IS NULL AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(thread_id.as_str())
            .bind(reader.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected() as i64,
        };

        if transitioned > 0 {
            sqlx::query(
                "UPDATE unread_counts SET count = MAX(count - ?, 0)
                 WHERE thread_id = ? AND user_id = ?",
            )
            .bind(transitioned)
            .bind(thread_id.as_str())
            .bind(reader.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(transitioned)
    }

    pub async fn list_messages(
        &self,
        thread_id: &ThreadId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some(before_id) = before {
            sqlx::query(
                "SELECT id, thread_id, sender_id, receiver_id, body, kind, metadata, created_at, read_at, edited_at
                 FROM messages
                 WHERE thread_id = ? AND id < ? AND deleted_at IS NULL
                 ORDER BY id DESC
                 LIMIT ?",
            )
            .bind(thread_id.as_str())
            .bind(before_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, thread_id, sender_id, receiver_id, body, kind, metadata, created_at, read_at, edited_at
                 FROM messages
                 WHERE thread_id = ? AND deleted_at IS NULL
                 ORDER BY id DESC
                 LIMIT ?",
            )
            .bind(thread_id.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows.into_iter().map(decode_message).collect())
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, thread_id, sender_id, receiver_id, body, kind, metadata, created_at, read_at, edited_at
             FROM messages
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(decode_message))
    }

    pub async fn unread_count(&self, thread_id: &ThreadId, user: &UserId) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM unread_counts WHERE thread_id = ? AND user_id = ?",
        )
        .bind(thread_id.as_str())
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    /// Sender-only edit; only text messages are editable.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        sender: &UserId,
        body: &str,
    ) -> Result<Option<StoredMessage>> {
        let now = Utc::now();
        let row = sqlx::query(
            "UPDATE messages SET body = ?, edited_at = ?
             WHERE id = ? AND sender_id = ? AND kind = 'text' AND deleted_at IS NULL
             RETURNING id, thread_id, sender_id, receiver_id, body, kind, metadata, created_at, read_at, edited_at",
        )
        .bind(body)
        .bind(now)
        .bind(message_id.0)
        .bind(sender.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(decode_message))
    }

    /// Soft delete by the sender; a still-unread message also leaves the
    /// receiver's unread accounting.
    pub async fn delete_message(&self, message_id: MessageId, sender: &UserId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT thread_id, receiver_id, read_at FROM messages
             WHERE id = ? AND sender_id = ? AND deleted_at IS NULL",
        )
        .bind(message_id.0)
        .bind(sender.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let thread_id: String = row.get(0);
        let receiver_id: String = row.get(1);
        let was_unread = row.get::<Option<DateTime<Utc>>, _>(2).is_none();

        sqlx::query("UPDATE messages SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;

        if was_unread {
            sqlx::query(
                "UPDATE unread_counts SET count = MAX(count - 1, 0)
                 WHERE thread_id = ? AND user_id = ?",
            )
            .bind(&thread_id)
            .bind(&receiver_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn threads_for_user(&self, user: &UserId) -> Result<Vec<ThreadOverview>> {
        let rows = sqlx::query(
            "SELECT t.thread_id, t.participant_a, t.participant_b, t.last_message_id, t.last_message_at, t.created_at,
                    COALESCE(u.count, 0)
             FROM threads t
             LEFT JOIN unread_counts u ON u.thread_id = t.thread_id AND u.user_id = ?
             WHERE t.participant_a = ? OR t.participant_b = ?
             ORDER BY t.last_message_at IS NULL, t.last_message_at DESC",
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut overviews = Vec::with_capacity(rows.len());
        for row in rows {
            let unread_count = row.get::<i64, _>(6);
            let thread = decode_thread(row);
            let last_message = match thread.last_message_id {
                Some(id) => self.message(id).await?,
                None => None,
            };
            overviews.push(ThreadOverview {
                thread,
                last_message,
                unread_count,
            });
        }
        Ok(overviews)
    }
}

fn decode_thread(row: sqlx::sqlite::SqliteRow) -> StoredThread {
    StoredThread {
        thread_id: ThreadId(row.get::<String, _>(0)),
        participant_a: UserId(row.get::<String, _>(1)),
        participant_b: UserId(row.get::<String, _>(2)),
        last_message_id: row.get::<Option<i64>, _>(3).map(MessageId),
        last_message_at: row.get::<Option<DateTime<Utc>>, _>(4),
        created_at: row.get::<DateTime<Utc>, _>(5),
    }
}

fn decode_message(row: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        id: MessageId(row.get::<i64, _>(0)),
        thread_id: ThreadId(row.get::<String, _>(1)),
        sender_id: UserId(row.get::<String, _>(2)),
        receiver_id: UserId(row.get::<String, _>(3)),
        body: row.get::<String, _>(4),
        kind: MessageKind::parse(&row.get::<String, _>(5)),
        metadata: row
            .get::<Option<String>, _>(6)
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get::<DateTime<Utc>, _>(7),
        read_at: row.get::<Option<DateTime<Utc>>, _>(8),
        edited_at: row.get::<Option<DateTime<Utc>>, _>(9),
    }
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
