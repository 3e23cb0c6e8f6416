use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{AppendOutcome, DurableStore, NewMessage};
use crate::models::{Conversation, Message, Role};
use crate::utils::StoreError;

struct StoredConversation {
    conversation: Conversation,
    messages: Vec<Message>,
}

/// Process-local durable tier, for `storage.backend = "memory"` and tests.
///
/// Mirrors the Postgres semantics: atomic append + count, strictly
/// increasing message timestamps per conversation.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<Uuid, StoredConversation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest(messages: &[Message], limit: i64) -> Vec<Message> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let start = messages.len().saturating_sub(limit);
        messages[start..].to_vec()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations.write().insert(
            conversation.id,
            StoredConversation { conversation: conversation.clone(), messages: Vec::new() },
        );
        Ok(())
    }

    async fn fetch_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().get(&id).map(|s| s.conversation.clone()))
    }

    async fn append_message(&self, id: Uuid, message: NewMessage) -> Result<AppendOutcome, StoreError> {
        let mut conversations = self.conversations.write();
        let stored = conversations.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let created_at = match stored.messages.last() {
            Some(last) if last.created_at >= message.requested_at => {
                last.created_at + Duration::microseconds(1)
            }
            _ => message.requested_at,
        };

        let persisted = Message {
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            created_at,
        };
        stored.messages.push(persisted.clone());
        stored.conversation.message_count += 1;
        stored.conversation.last_activity = stored.conversation.last_activity.max(created_at);

        Ok(AppendOutcome { message: persisted, conversation: stored.conversation.clone() })
    }

    async fn recent_messages(&self, id: Uuid, limit: i64) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .conversations
            .read()
            .get(&id)
            .map(|s| Self::newest(&s.messages, limit))
            .unwrap_or_default())
    }

    async fn messages_before(
        &self,
        id: Uuid,
        cursor: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .conversations
            .read()
            .get(&id)
            .map(|s| {
                let older = s.messages.partition_point(|m| m.created_at < cursor);
                Self::newest(&s.messages[..older], limit)
            })
            .unwrap_or_default())
    }

    async fn has_messages_before(&self, id: Uuid, before: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self
            .conversations
            .read()
            .get(&id)
            .is_some_and(|s| s.messages.first().is_some_and(|m| m.created_at < before)))
    }

    async fn first_message_by(&self, id: Uuid, role: Role) -> Result<Option<Message>, StoreError> {
        Ok(self
            .conversations
            .read()
            .get(&id)
            .and_then(|s| {
                s.messages
                    .iter()
                    .find(|m| m.role == role && !m.content.trim().is_empty())
                    .cloned()
            }))
    }

    async fn update_title(&self, id: Uuid, title: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.write().get_mut(&id).map(|s| {
            s.conversation.title = Some(title.to_string());
            s.conversation.clone()
        }))
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.conversations.write().remove(&id).is_some())
    }

    async fn list_conversations(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut owned: Vec<Conversation> = self
            .conversations
            .read()
            .values()
            .filter(|s| s.conversation.owner == owner)
            .map(|s| s.conversation.clone())
            .collect();
        owned.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        Ok(owned
            .into_iter()
            .skip(usize::try_from(offset.max(0)).unwrap_or(0))
            .take(usize::try_from(limit.max(0)).unwrap_or(0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{timestamp_now, Role};
    use serde_json::Map;

    fn new_message(content: &str, at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            role: Role::User,
            content: content.to_string(),
            metadata: Map::new(),
            requested_at: at,
        }
    }

    #[tokio::test]
    async fn test_same_instant_appends_get_distinct_timestamps() {
        let store = InMemoryStore::new();
        let conversation = Conversation::new("u1", timestamp_now());
        store.insert_conversation(&conversation).await.unwrap();

        let at = timestamp_now();
        let first = store.append_message(conversation.id, new_message("a", at)).await.unwrap();
        let second = store.append_message(conversation.id, new_message("b", at)).await.unwrap();

        assert!(second.message.created_at > first.message.created_at);
        assert_eq!(second.conversation.message_count, 2);
    }

    #[tokio::test]
    async fn test_append_to_missing_conversation_fails() {
        let store = InMemoryStore::new();
        let err = store
            .append_message(Uuid::new_v4(), new_message("a", timestamp_now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_messages_before_is_strict() {
        let store = InMemoryStore::new();
        let conversation = Conversation::new("u1", timestamp_now());
        store.insert_conversation(&conversation).await.unwrap();
        for content in ["a", "b", "c", "d"] {
            store.append_message(conversation.id, new_message(content, timestamp_now())).await.unwrap();
        }

        let all = store.recent_messages(conversation.id, 10).await.unwrap();
        let older = store.messages_before(conversation.id, all[2].created_at, 10).await.unwrap();

        let contents: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
        assert!(store.has_messages_before(conversation.id, all[1].created_at).await.unwrap());
        assert!(!store.has_messages_before(conversation.id, all[0].created_at).await.unwrap());
    }
}
