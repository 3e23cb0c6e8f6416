use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::RedisConfig;
use crate::database::{AppendOutcome, DurableStore, NewMessage};
use crate::models::{is_real_title, timestamp_now, Conversation, Message, MessagePage, Role};
use crate::utils::StoreError;

pub const DEFAULT_LIST_LIMIT: i64 = 20;

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub max_cached_messages: usize,
}

impl CachePolicy {
    pub fn from_settings(config: &RedisConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_seconds),
            max_cached_messages: config.max_cached_messages.max(1),
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(7 * 24 * 60 * 60), max_cached_messages: 100 }
    }
}

fn conversation_key(id: Uuid) -> String {
    format!("conversation:{}", id)
}

fn messages_key(id: Uuid) -> String {
    format!("conversation:{}:messages", id)
}

fn newest(messages: &[Message], limit: usize) -> Vec<Message> {
    messages[messages.len().saturating_sub(limit)..].to_vec()
}

/// Read-through / write-through store over a cache tier and a durable tier.
///
/// The durable tier is the source of truth. Cache failures are logged and
/// never fail an operation; a cache entry that could not be brought up to
/// date after a durable write is invalidated instead.
pub struct ConversationStore {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn CacheStore>,
    policy: CachePolicy,
}

impl ConversationStore {
    pub fn new(durable: Arc<dyn DurableStore>, cache: Arc<dyn CacheStore>, policy: CachePolicy) -> Self {
        Self { durable, cache, policy }
    }

    // ===== Cache helpers =====

    async fn cache_read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", key, e);
                    let _ = self.cache.delete(&[key.to_string()]).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn cache_write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.cache.set(key, &raw, self.policy.ttl).await
    }

    async fn invalidate(&self, id: Uuid) {
        if let Err(e) = self.cache.delete(&[conversation_key(id), messages_key(id)]).await {
            warn!("Cache invalidation failed for conversation {}: {}", id, e);
        }
    }

    async fn cached_messages(&self, id: Uuid) -> Option<Vec<Message>> {
        self.cache_read(&messages_key(id)).await
    }

    // ===== Operations =====

    /// New conversation with no messages and no title
    pub async fn create_conversation(&self, owner: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(owner, timestamp_now());
        self.durable.insert_conversation(&conversation).await?;

        let empty: Vec<Message> = Vec::new();
        let cached = async {
            self.cache_write(&conversation_key(conversation.id), &conversation).await?;
            self.cache_write(&messages_key(conversation.id), &empty).await
        }
        .await;
        if let Err(e) = cached {
            warn!("Could not cache new conversation {}: {}", conversation.id, e);
            self.invalidate(conversation.id).await;
        }

        debug!("Created conversation {} for user {}", conversation.id, owner);
        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        if let Some(conversation) = self.cache_read::<Conversation>(&conversation_key(id)).await {
            return Ok(Some(conversation));
        }

        let Some(conversation) = self.durable.fetch_conversation(id).await? else {
            return Ok(None);
        };
        if let Err(e) = self.cache_write(&conversation_key(id), &conversation).await {
            warn!("Could not repopulate cache for conversation {}: {}", id, e);
        }
        Ok(Some(conversation))
    }

    /// Whether a real title was set. Always asks the durable tier.
    pub async fn has_title(&self, id: Uuid) -> Result<bool, StoreError> {
        let conversation = self.durable.fetch_conversation(id).await?;
        Ok(conversation.is_some_and(|c| is_real_title(c.title.as_deref())))
    }

    pub async fn add_message(
        &self,
        id: Uuid,
        role: Role,
        content: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Message, StoreError> {
        let outcome = self
            .durable
            .append_message(
                id,
                NewMessage {
                    role,
                    content: content.to_string(),
                    metadata: metadata.unwrap_or_default(),
                    requested_at: timestamp_now(),
                },
            )
            .await?;

        if let Err(e) = self.sync_cache_after_append(id, &outcome).await {
            warn!("Cache out of sync for conversation {}, invalidating: {}", id, e);
            self.invalidate(id).await;
        }
        Ok(outcome.message)
    }

    async fn sync_cache_after_append(&self, id: Uuid, outcome: &AppendOutcome) -> Result<(), StoreError> {
        self.cache_write(&conversation_key(id), &outcome.conversation).await?;

        // Only extend a list that is already cached; a partial list would
        // masquerade as the conversation's most recent messages
        let key = messages_key(id);
        if let Some(raw) = self.cache.get(&key).await? {
            let mut messages: Vec<Message> = serde_json::from_str(&raw)?;
            messages.push(outcome.message.clone());
            let overflow = messages.len().saturating_sub(self.policy.max_cached_messages);
            messages.drain(..overflow);
            self.cache_write(&key, &messages).await?;
        }
        Ok(())
    }

    /// Newest `limit` messages in chronological order
    pub async fn get_recent_messages(&self, id: Uuid, limit: usize) -> Result<Vec<Message>, StoreError> {
        let limit = limit.max(1);
        let cached = self.cached_messages(id).await;
        if let Some(cached) = &cached {
            if cached.len() >= limit {
                return Ok(newest(cached, limit));
            }
        }

        let messages = self.durable.recent_messages(id, limit as i64).await?;

        let cached_len = cached.as_ref().map_or(0, Vec::len);
        if messages.len() > cached_len {
            let refill = newest(&messages, self.policy.max_cached_messages);
            if let Err(e) = self.cache_write(&messages_key(id), &refill).await {
                warn!("Could not refill message cache for {}: {}", id, e);
            }
        }
        Ok(messages)
    }

    /// One page of history walking backwards from `cursor` (exclusive)
    pub async fn get_messages_paginated(
        &self,
        id: Uuid,
        limit: usize,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<MessagePage, StoreError> {
        let limit = limit.max(1);

        let messages = match cursor {
            None => match self.cached_messages(id).await {
                Some(cached) if cached.len() >= limit => newest(&cached, limit),
                _ => self.durable.recent_messages(id, limit as i64).await?,
            },
            Some(cursor) => self.durable.messages_before(id, cursor, limit as i64).await?,
        };

        let (has_more, next_cursor) = match messages.first() {
            Some(oldest) => {
                let has_more = self.durable.has_messages_before(id, oldest.created_at).await?;
                (has_more, has_more.then_some(oldest.created_at))
            }
            None => (false, None),
        };

        Ok(MessagePage { messages, has_more, next_cursor })
    }

    /// Opening user message, however long the history has grown
    pub async fn first_user_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.durable.first_message_by(id, Role::User).await
    }

    /// Fails with `NotFound` if the conversation does not exist
    pub async fn rename_conversation(&self, id: Uuid, title: &str) -> Result<Conversation, StoreError> {
        let updated = self
            .durable
            .update_title(id, title)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        if let Err(e) = self.cache_write(&conversation_key(id), &updated).await {
            warn!("Could not cache renamed conversation {}: {}", id, e);
            self.invalidate(id).await;
        }
        Ok(updated)
    }

    /// Returns false when there was nothing to delete
    pub async fn delete_conversation(&self, id: Uuid) -> Result<bool, StoreError> {
        self.invalidate(id).await;
        let deleted = self.durable.delete_conversation(id).await?;
        // A concurrent read may have refilled the cache in between
        self.invalidate(id).await;
        Ok(deleted)
    }

    pub async fn list_conversations(
        &self,
        owner: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
        let offset = offset.unwrap_or(0).max(0);
        self.durable.list_conversations(owner, limit, offset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, MockCacheStore};
    use crate::database::{InMemoryStore, MockDurableStore};

    fn store_with(policy: CachePolicy) -> (ConversationStore, MemoryCache) {
        let cache = MemoryCache::new();
        let store = ConversationStore::new(Arc::new(InMemoryStore::new()), Arc::new(cache.clone()), policy);
        (store, cache)
    }

    fn store() -> ConversationStore {
        store_with(CachePolicy::default()).0
    }

    async fn seed(store: &ConversationStore, id: Uuid, count: usize) -> Vec<Message> {
        let mut persisted = Vec::new();
        for i in 0..count {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            persisted.push(store.add_message(id, role, &format!("message {}", i), None).await.unwrap());
        }
        persisted
    }

    async fn walk_pages(store: &ConversationStore, id: Uuid, limit: usize) -> Vec<Vec<Message>> {
        let mut pages = Vec::new();
        let mut cursor = None;
        loop {
            let page = store.get_messages_paginated(id, limit, cursor).await.unwrap();
            assert_eq!(page.has_more, page.next_cursor.is_some());
            cursor = page.next_cursor;
            let has_more = page.has_more;
            pages.push(page.messages);
            if !has_more {
                return pages;
            }
        }
    }

    #[tokio::test]
    async fn test_pagination_reconstructs_history_without_gaps() {
        let store = store();
        let conversation = store.create_conversation("u1").await.unwrap();
        let persisted = seed(&store, conversation.id, 23).await;

        for limit in [1, 5, 7, 23, 50] {
            let pages = walk_pages(&store, conversation.id, limit).await;

            let mut rebuilt: Vec<Message> = pages.into_iter().rev().flatten().collect();
            assert_eq!(rebuilt.len(), persisted.len(), "limit {}", limit);
            assert_eq!(rebuilt, persisted, "limit {}", limit);
            rebuilt.dedup_by(|a, b| a.created_at == b.created_at);
            assert_eq!(rebuilt.len(), persisted.len());
        }
    }

    #[tokio::test]
    async fn test_count_matches_paginated_total() {
        let store = store();
        let conversation = store.create_conversation("u1").await.unwrap();
        seed(&store, conversation.id, 12).await;

        let meta = store.get_conversation(conversation.id).await.unwrap().unwrap();
        let total: usize = walk_pages(&store, conversation.id, 5).await.iter().map(Vec::len).sum();

        assert_eq!(meta.message_count, 12);
        assert_eq!(meta.message_count as usize, total);
    }

    #[tokio::test]
    async fn test_first_page_served_from_cache_matches_durable_shape() {
        let (store, cache) = store_with(CachePolicy::default());
        let conversation = store.create_conversation("u1").await.unwrap();
        seed(&store, conversation.id, 6).await;

        let from_cache = store.get_messages_paginated(conversation.id, 4, None).await.unwrap();
        cache.delete(&[messages_key(conversation.id)]).await.unwrap();
        let from_durable = store.get_messages_paginated(conversation.id, 4, None).await.unwrap();

        assert_eq!(from_cache, from_durable);
        assert!(from_cache.has_more);
    }

    #[tokio::test]
    async fn test_cached_list_is_bounded_to_newest() {
        let (store, cache) = store_with(CachePolicy { ttl: Duration::from_secs(60), max_cached_messages: 3 });
        let conversation = store.create_conversation("u1").await.unwrap();
        let persisted = seed(&store, conversation.id, 5).await;

        let raw = cache.get(&messages_key(conversation.id)).await.unwrap().unwrap();
        let cached: Vec<Message> = serde_json::from_str(&raw).unwrap();
        assert_eq!(cached, persisted[2..].to_vec());

        let recent = store.get_recent_messages(conversation.id, 5).await.unwrap();
        assert_eq!(recent, persisted);
    }

    #[tokio::test]
    async fn test_rename_twice_is_stable() {
        let store = store();
        let conversation = store.create_conversation("u1").await.unwrap();
        assert!(!store.has_title(conversation.id).await.unwrap());

        store.rename_conversation(conversation.id, "Recipes").await.unwrap();
        let first = store.get_conversation(conversation.id).await.unwrap().unwrap();
        store.rename_conversation(conversation.id, "Recipes").await.unwrap();
        let second = store.get_conversation(conversation.id).await.unwrap().unwrap();

        assert_eq!(first.display_title(), "Recipes");
        assert_eq!(first, second);
        assert!(store.has_title(conversation.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_missing_conversation_is_not_found() {
        let err = store().rename_conversation(Uuid::new_v4(), "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let (store, cache) = store_with(CachePolicy::default());
        let conversation = store.create_conversation("u1").await.unwrap();
        seed(&store, conversation.id, 3).await;

        assert!(store.delete_conversation(conversation.id).await.unwrap());
        assert!(store.get_conversation(conversation.id).await.unwrap().is_none());
        assert!(store.get_recent_messages(conversation.id, 10).await.unwrap().is_empty());
        assert!(cache.is_empty());
        assert!(!store.delete_conversation(conversation.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_orders_by_activity_and_scopes_owner() {
        let store = store();
        let older = store.create_conversation("u1").await.unwrap();
        let newer = store.create_conversation("u1").await.unwrap();
        store.create_conversation("someone-else").await.unwrap();
        store.add_message(older.id, Role::User, "bump", None).await.unwrap();

        let listed = store.list_conversations("u1", None, None).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);

        let second_page = store.list_conversations("u1", Some(1), Some(1)).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].id, newer.id);
    }

    #[tokio::test]
    async fn test_recent_served_from_cache_when_it_holds_enough() {
        let conversation = Conversation::new("u1", timestamp_now());
        let cached: Vec<Message> = (0..4)
            .map(|i| Message {
                role: Role::User,
                content: format!("c{}", i),
                metadata: Map::new(),
                created_at: timestamp_now(),
            })
            .collect();
        let raw = serde_json::to_string(&cached).unwrap();

        let mut durable = MockDurableStore::new();
        durable.expect_recent_messages().never();
        let mut cache = MockCacheStore::new();
        cache.expect_get().returning(move |_| Ok(Some(raw.clone())));

        let store = ConversationStore::new(Arc::new(durable), Arc::new(cache), CachePolicy::default());
        let recent = store.get_recent_messages(conversation.id, 3).await.unwrap();

        assert_eq!(recent, cached[1..].to_vec());
    }

    #[tokio::test]
    async fn test_durable_write_failure_propagates_and_skips_cache() {
        let mut durable = MockDurableStore::new();
        durable
            .expect_append_message()
            .returning(|_, _| Err(StoreError::Database(sqlx::Error::PoolTimedOut)));
        let mut cache = MockCacheStore::new();
        cache.expect_set().never();
        cache.expect_get().never();

        let store = ConversationStore::new(Arc::new(durable), Arc::new(cache), CachePolicy::default());
        let err = store.add_message(Uuid::new_v4(), Role::User, "hi", None).await.unwrap_err();

        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn test_cache_outage_does_not_fail_operations() {
        let mut cache = MockCacheStore::new();
        cache.expect_get().returning(|_| Err(StoreError::Cache("connection refused".into())));
        cache.expect_set().returning(|_, _, _| Err(StoreError::Cache("connection refused".into())));
        cache.expect_delete().returning(|_| Err(StoreError::Cache("connection refused".into())));

        let store = ConversationStore::new(Arc::new(InMemoryStore::new()), Arc::new(cache), CachePolicy::default());
        let conversation = store.create_conversation("u1").await.unwrap();
        store.add_message(conversation.id, Role::User, "hi", None).await.unwrap();

        let meta = store.get_conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(meta.message_count, 1);
        assert_eq!(store.get_recent_messages(conversation.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_to_unknown_conversation_is_not_found() {
        let err = store().add_message(Uuid::new_v4(), Role::User, "hi", None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
