use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::CacheStore;
use crate::utils::StoreError;

#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process cache tier used when no Redis url is configured.
/// Uses DashMap for lock-free concurrent access; expiry is lazy.
#[derive(Clone, Default)]
pub struct MemoryCache {
    storage: Arc<DashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        info!("Initializing in-process conversation cache");
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let start_len = self.storage.len();
        self.storage.retain(|_, entry| !entry.is_expired());
        let count = start_len.saturating_sub(self.storage.len());

        if count > 0 {
            debug!("Cleaned up {} expired cache entries", count);
        }
        count
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(entry) = self.storage.get(key) else {
            return Ok(None);
        };

        if entry.is_expired() {
            drop(entry); // Release read lock
            self.storage.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.storage.insert(
            key.to_string(),
            CacheEntry { value: value.to_string(), expires_at: Instant::now() + ttl },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.storage.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.delete(&["k".to_string()]).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let cache = MemoryCache::new();
        cache.set("gone", "v", Duration::ZERO).await.unwrap();
        cache.set("kept", "v", Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get("gone").await.unwrap(), None);
        cache.set("gone-too", "v", Duration::ZERO).await.unwrap();
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
