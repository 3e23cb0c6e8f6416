use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::{AppendOutcome, ConversationRow, DbPool, DurableStore, MessageRow, NewMessage};
use crate::models::{Conversation, Message, Role};
use crate::utils::StoreError;

const CONVERSATION_COLUMNS: &str = "id, user_id, created_at, last_activity, message_count, name";
const MESSAGE_COLUMNS: &str = "sender_role, content, message_metadata, created_at";

/// Postgres-backed durable tier
pub struct Repository {
    pub pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, StoreError> {
        // Queries read newest-first; callers want chronological order
        rows.into_iter().rev().map(Message::try_from).collect()
    }
}

#[async_trait]
impl DurableStore for Repository {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO chat_conversations (id, user_id, created_at, last_activity, message_count, name)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(conversation.id)
        .bind(&conversation.owner)
        .bind(conversation.created_at)
        .bind(conversation.last_activity)
        .bind(conversation.message_count as i32)
        .bind(conversation.title.as_deref())
        .execute(self.pool.get_pool())
        .await?;

        debug!("Inserted conversation {} for user {}", conversation.id, conversation.owner);
        Ok(())
    }

    async fn fetch_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {} FROM chat_conversations WHERE id = $1",
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(row.map(Conversation::from))
    }

    async fn append_message(&self, id: Uuid, message: NewMessage) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.get_pool().begin().await?;

        // Serializes appends per conversation so timestamps stay strictly increasing
        let locked = sqlx::query("SELECT id FROM chat_conversations WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound(id));
        }

        let created_at: DateTime<Utc> = sqlx::query(
            r#"INSERT INTO chat_messages (id, conversation_id, sender_role, content, message_metadata, created_at)
               VALUES ($1, $2, $3, $4, $5, GREATEST(
                   $6,
                   COALESCE(
                       (SELECT MAX(created_at) + INTERVAL '1 microsecond'
                          FROM chat_messages WHERE conversation_id = $2),
                       $6
                   )
               ))
               RETURNING created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(Json(serde_json::Value::Object(message.metadata.clone())))
        .bind(message.requested_at)
        .fetch_one(&mut *tx)
        .await?
        .try_get("created_at")?;

        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"UPDATE chat_conversations
               SET message_count = message_count + 1,
                   last_activity = GREATEST(last_activity, $2)
               WHERE id = $1
               RETURNING {}"#,
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AppendOutcome {
            message: Message {
                role: message.role,
                content: message.content,
                metadata: message.metadata,
                created_at,
            },
            conversation: row.into(),
        })
    }

    async fn recent_messages(&self, id: Uuid, limit: i64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT {} FROM chat_messages
               WHERE conversation_id = $1
               ORDER BY created_at DESC
               LIMIT $2"#,
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        Self::into_messages(rows)
    }

    async fn messages_before(
        &self,
        id: Uuid,
        cursor: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT {} FROM chat_messages
               WHERE conversation_id = $1 AND created_at < $2
               ORDER BY created_at DESC
               LIMIT $3"#,
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(cursor)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        Self::into_messages(rows)
    }

    async fn has_messages_before(&self, id: Uuid, before: DateTime<Utc>) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS(
                   SELECT 1 FROM chat_messages
                   WHERE conversation_id = $1 AND created_at < $2
               )"#,
        )
        .bind(id)
        .bind(before)
        .fetch_one(self.pool.get_pool())
        .await?;

        Ok(exists)
    }

    async fn first_message_by(&self, id: Uuid, role: Role) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT {} FROM chat_messages
               WHERE conversation_id = $1 AND sender_role = $2 AND btrim(content) <> ''
               ORDER BY created_at ASC
               LIMIT 1"#,
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(role.as_str())
        .fetch_optional(self.pool.get_pool())
        .await?;

        row.map(Message::try_from).transpose()
    }

    async fn update_title(&self, id: Uuid, title: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "UPDATE chat_conversations SET name = $2 WHERE id = $1 RETURNING {}",
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .bind(title)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(row.map(Conversation::from))
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.get_pool().begin().await?;

        sqlx::query("DELETE FROM chat_messages WHERE conversation_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM chat_conversations WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn list_conversations(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            r#"SELECT {} FROM chat_conversations
               WHERE user_id = $1
               ORDER BY last_activity DESC
               LIMIT $2 OFFSET $3"#,
            CONVERSATION_COLUMNS
        ))
        .bind(owner)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows.into_iter().map(Conversation::from).collect())
    }
}
