use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::{Conversation, Message, Role};
use crate::utils::StoreError;

/// Message about to be appended. `requested_at` may be bumped by the store to
/// keep timestamps strictly increasing within the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    pub message: Message,
    /// Conversation state right after the append
    pub conversation: Conversation,
}

#[derive(Debug, Clone, FromRow)]
pub struct ConversationRow {
    pub id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: i32,
    pub name: Option<String>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            owner: row.user_id,
            created_at: row.created_at,
            last_activity: row.last_activity,
            message_count: i64::from(row.message_count),
            title: row.name,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub sender_role: String,
    pub content: String,
    pub message_metadata: Option<Json<Value>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = row.sender_role.parse::<Role>().map_err(StoreError::Corrupt)?;
        let metadata = match row.message_metadata.map(|Json(value)| value) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Ok(Message {
            role,
            content: row.content,
            metadata,
            created_at: row.created_at,
        })
    }
}
