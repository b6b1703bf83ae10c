use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info};

use shared::domain::{
    ActorId, ConversationKey, GenderTag, Message, MessageId, MessageTarget, RoomId, TenantId,
};

/// Settings key holding the JSON-encoded local actor record.
pub const CURRENT_ACTOR_KEY: &str = "current_actor";

const MESSAGE_COLUMNS: &str = "id, room_id, recipient_id, sender_id, sender_alias, sender_gender, \
     text, image_ref, sent_at_ms, tenant_id";

/// Persistent local message cache plus a small key/value settings table.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectConversation {
    pub peer_id: ActorId,
    pub messages: Vec<Message>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open local cache at {database_url}"))?;
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

    /// Upserts a message; a later write for the same id replaces the row.
    pub async fn save_message(&self, message: &Message, is_room_scoped: bool) -> Result<()> {
        let (room_id, recipient_id) = match &message.target {
            MessageTarget::Room(room_id) => (Some(room_id.as_str()), None),
            MessageTarget::Direct(recipient) => (None, Some(recipient.as_str())),
        };
        sqlx::query(
            "INSERT INTO messages (id, room_id, recipient_id, sender_id, sender_alias, sender_gender,
                                   text, image_ref, sent_at_ms, tenant_id, is_room_scoped)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                room_id = excluded.room_id,
                recipient_id = excluded.recipient_id,
                sender_id = excluded.sender_id,
                sender_alias = excluded.sender_alias,
                sender_gender = excluded.sender_gender,
                text = excluded.text,
                image_ref = excluded.image_ref,
                sent_at_ms = excluded.sent_at_ms,
                tenant_id = excluded.tenant_id,
                is_room_scoped = excluded.is_room_scoped",
        )
        .bind(message.id.as_str())
        .bind(room_id)
        .bind(recipient_id)
        .bind(message.sender_id.as_str())
        .bind(&message.sender_alias)
        .bind(message.sender_gender.as_str())
        .bind(&message.text)
        .bind(message.image_ref.as_deref())
        .bind(message.timestamp.timestamp_millis())
        .bind(message.tenant_id.as_ref().map(TenantId::as_str))
        .bind(is_room_scoped)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save message {}", message.id))?;
        Ok(())
    }

    /// Newest `limit` messages of a conversation inside the retention window,
    /// ascending by `(timestamp, id)`. Expired rows are purged first.
    pub async fn query_conversation(
        &self,
        key: &ConversationKey,
        retention: Duration,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let cutoff = Utc::now() - retention;
        self.purge_before(cutoff).await?;

        let cutoff_ms = cutoff.timestamp_millis();
        let limit = i64::from(limit.max(1));
        let rows = match key {
            ConversationKey::Room(room_id) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM (
                        SELECT * FROM messages
                        WHERE is_room_scoped = 1 AND room_id = ? AND sent_at_ms >= ?
                        ORDER BY sent_at_ms DESC, id DESC
                        LIMIT ?
                     ) ORDER BY sent_at_ms ASC, id ASC"
                ))
                .bind(room_id.as_str())
                .bind(cutoff_ms)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            ConversationKey::Direct(peer_id) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM (
                        SELECT * FROM messages
                        WHERE is_room_scoped = 0
                          AND (sender_id = ?1 OR recipient_id = ?1)
                          AND sent_at_ms >= ?2
                        ORDER BY sent_at_ms DESC, id DESC
                        LIMIT ?3
                     ) ORDER BY sent_at_ms ASC, id ASC"
                ))
                .bind(peer_id.as_str())
                .bind(cutoff_ms)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .with_context(|| format!("failed to query cached messages for {key}"))?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete message {message_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_conversation(&self, key: &ConversationKey) -> Result<u64> {
        let result = match key {
            ConversationKey::Room(room_id) => {
                sqlx::query("DELETE FROM messages WHERE is_room_scoped = 1 AND room_id = ?")
                    .bind(room_id.as_str())
                    .execute(&self.pool)
                    .await
            }
            ConversationKey::Direct(peer_id) => sqlx::query(
                "DELETE FROM messages
                 WHERE is_room_scoped = 0 AND (sender_id = ?1 OR recipient_id = ?1)",
            )
            .bind(peer_id.as_str())
            .execute(&self.pool)
            .await,
        }
        .with_context(|| format!("failed to delete cached conversation {key}"))?;
        debug!(conversation = %key, rows = result.rows_affected(), "cache: deleted conversation");
        Ok(result.rows_affected())
    }

    /// Single delete-by-predicate so the sweep never races a reader.
    pub async fn purge_older_than(&self, retention: Duration) -> Result<u64> {
        self.purge_before(Utc::now() - retention).await
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE sent_at_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("failed to purge expired messages")?;
        if result.rows_affected() > 0 {
            info!(
                purged = result.rows_affected(),
                cutoff = %cutoff,
                "cache: purged expired messages"
            );
        }
        Ok(result.rows_affected())
    }

    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM messages")
            .execute(&self.pool)
            .await
            .context("failed to clear cached messages")?;
        Ok(())
    }

    /// Direct conversations inside the retention window, grouped by the peer
    /// of `local_actor_id`.
    pub async fn list_direct_conversations(
        &self,
        local_actor_id: &ActorId,
        retention: Duration,
    ) -> Result<Vec<DirectConversation>> {
        let cutoff = Utc::now() - retention;
        self.purge_before(cutoff).await?;

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE is_room_scoped = 0 AND sent_at_ms >= ?
             ORDER BY sent_at_ms ASC, id ASC"
        ))
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .context("failed to load cached direct conversations")?;

        let mut grouped: BTreeMap<ActorId, Vec<Message>> = BTreeMap::new();
        for row in &rows {
            let message = message_from_row(row)?;
            let key = message.conversation_key_for(|id| id == local_actor_id);
            if let ConversationKey::Direct(peer_id) = key {
                grouped.entry(peer_id).or_default().push(message);
            }
        }

        Ok(grouped
            .into_iter()
            .map(|(peer_id, messages)| DirectConversation { peer_id, messages })
            .collect())
    }

    /// Room ids with cached messages and their row counts.
    pub async fn list_cached_rooms(&self) -> Result<Vec<(RoomId, i64)>> {
        let rows = sqlx::query(
            "SELECT room_id, COUNT(*) FROM messages
             WHERE is_room_scoped = 1 AND room_id IS NOT NULL
             GROUP BY room_id ORDER BY room_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list cached rooms")?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    RoomId::new(row.try_get::<String, _>(0)?),
                    row.try_get::<i64, _>(1)?,
                ))
            })
            .collect()
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM app_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read setting {key}"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write setting {key}"))?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM app_settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete setting {key}"))?;
        Ok(())
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let id: String = row.try_get("id")?;
    let room_id: Option<String> = row.try_get("room_id")?;
    let recipient_id: Option<String> = row.try_get("recipient_id")?;
    let target = match (room_id, recipient_id) {
        (Some(room_id), _) => MessageTarget::Room(RoomId::new(room_id)),
        (None, Some(recipient_id)) => MessageTarget::Direct(ActorId::new(recipient_id)),
        (None, None) => return Err(anyhow!("cached message {id} has no room or recipient")),
    };
    let sent_at_ms: i64 = row.try_get("sent_at_ms")?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(sent_at_ms)
        .ok_or_else(|| anyhow!("cached message {id} has invalid timestamp {sent_at_ms}"))?;
    let gender: String = row.try_get("sender_gender")?;

    Ok(Message {
        id: MessageId::new(id),
        target,
        sender_id: ActorId::new(row.try_get::<String, _>("sender_id")?),
        sender_alias: row.try_get("sender_alias")?,
        sender_gender: GenderTag::from_tag(&gender),
        text: row.try_get("text")?,
        image_ref: row.try_get("image_ref")?,
        timestamp,
        tenant_id: row
            .try_get::<Option<String>, _>("tenant_id")?
            .map(TenantId::new),
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
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
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
