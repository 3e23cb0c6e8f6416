use async_trait::async_trait;
use deadpool_redis::redis::{cmd, AsyncCommands};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use std::time::Duration;
use tracing::info;

use super::CacheStore;
use crate::config::RedisConfig;
use crate::utils::StoreError;

fn cache_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Cache(err.to_string())
}

/// Redis cache tier over a deadpool connection pool
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let mut pool_config = Config::from_url(config.url.clone());
        pool_config.pool = Some(PoolConfig::new(config.pool_max_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(cache_error)?;

        info!("Redis pool created (max_size={})", config.pool_max_size);
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(cache_error)
    }

    /// Readiness probe
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<String>>(key).await.map_err(cache_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(cache_error)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(keys).await.map_err(cache_error)
    }
}
