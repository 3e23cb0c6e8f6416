pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod schema;

pub use memory::InMemoryStore;
pub use models::*;
pub use pool::DbPool;
pub use repository::Repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Conversation, Message, Role};
use crate::utils::StoreError;

/// Source-of-truth tier of the conversation store.
///
/// Message lists come back in chronological order. Appends must bump
/// `message_count` and `last_activity` in the same atomic step as the insert.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    async fn fetch_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    /// Fails with `NotFound` when the conversation does not exist
    async fn append_message(&self, id: Uuid, message: NewMessage) -> Result<AppendOutcome, StoreError>;

    /// The newest `limit` messages
    async fn recent_messages(&self, id: Uuid, limit: i64) -> Result<Vec<Message>, StoreError>;

    /// The newest `limit` messages strictly older than `cursor`
    async fn messages_before(
        &self,
        id: Uuid,
        cursor: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;

    async fn has_messages_before(&self, id: Uuid, before: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Oldest non-blank message sent with `role`
    async fn first_message_by(&self, id: Uuid, role: Role) -> Result<Option<Message>, StoreError>;

    /// Returns the updated record, `None` if the conversation does not exist
    async fn update_title(&self, id: Uuid, title: &str) -> Result<Option<Conversation>, StoreError>;

    /// Removes the conversation and every message it owns; false if absent
    async fn delete_conversation(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Ordered by `last_activity` descending
    async fn list_conversations(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>, StoreError>;
}
