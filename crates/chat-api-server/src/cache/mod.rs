pub mod memory;
pub mod redis;

pub use memory::MemoryCache;
pub use self::redis::RedisCache;

use async_trait::async_trait;
use std::time::Duration;

use crate::utils::StoreError;

/// Fast, shared key-value tier in front of the durable store.
///
/// Values are opaque strings (JSON documents). Every write carries a TTL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
}
