use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::{ChatError, EntityId, UserId};

const COLUMNS: &str = "id,from_user_id,to_user_id,entity_id,text,created_at,is_read";

/// A message as it lives in the durable log. Immutable apart from `is_read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub entity_id: EntityId,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_read: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub entity_id: EntityId,
    pub text: String,
}

/// Append-only message log. Only `is_read` is ever updated.
#[derive(Clone)]
pub struct MessageStore {
    db_pool: SqlitePool,
}

impl MessageStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        MessageStore { db_pool }
    }

    pub async fn append(&self, NewMessage { from_user_id, to_user_id, entity_id, text }: NewMessage) -> Result<StoredMessage, ChatError> {
        let stored = sqlx::query_as::<_, StoredMessage>(&format!(
            "INSERT INTO messages (from_user_id,to_user_id,entity_id,text,created_at,is_read) VALUES (?,?,?,?,?,0) RETURNING {COLUMNS}"
        ))
            .bind(from_user_id)
            .bind(to_user_id)
            .bind(entity_id)
            .bind(&text)
            .bind(OffsetDateTime::now_utc())
            .fetch_one(&self.db_pool)
            .await?;

        tracing::debug!(id = stored.id, from_user_id, to_user_id, "message stored");
        Ok(stored)
    }

    /// Every message exchanged between `a` and `b`, oldest first.
    pub async fn find_conversation(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>, ChatError> {
        let messages = sqlx::query_as::<_, StoredMessage>(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE (from_user_id=? AND to_user_id=?) OR (from_user_id=? AND to_user_id=?)
             ORDER BY created_at, id"
        ))
            .bind(a)
            .bind(b)
            .bind(b)
            .bind(a)
            .fetch_all(&self.db_pool)
            .await?;

        Ok(messages)
    }

    pub async fn count_unread(&self, recipient: UserId) -> Result<i64, ChatError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE to_user_id=? AND is_read=0")
                .bind(recipient)
                .fetch_one(&self.db_pool)
                .await?;

        Ok(count)
    }

    /// Marks everything `sender` sent to `recipient` as read. Returns how many rows changed.
    pub async fn mark_read(&self, recipient: UserId, sender: UserId) -> Result<u64, ChatError> {
        let result = sqlx::query("UPDATE messages SET is_read=1 WHERE to_user_id=? AND from_user_id=? AND is_read=0")
            .bind(recipient)
            .bind(sender)
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected())
    }
}
