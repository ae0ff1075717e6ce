//! Shared key-value storage with TTL. Both the session store and the
//! profile store live on top of this; with the redis backend the entries
//! are shared across all workers of the deployment.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod memory;
pub mod null;
pub mod redis;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to serialize value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to parse value: {0}")]
    Deserialization(String),
    #[error("Redis error: {0}")]
    Redis(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Contract all store backends fulfill. Values are JSON-serialized; every
/// entry expires after the configured TTL. Implementations are cloneable
/// and shared across handlers.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    /// Store a value under a key with the backend's default TTL
    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T)
        -> Result<(), CacheError>;

    /// Retrieve a value; `None` when missing or expired
    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError>;

    /// Remove a value
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Ping the backend; for redis this round-trips to the server
    async fn health_check(&self) -> Result<(), String>;
}

/// Type-safe wrapper over the configured backend. The concrete backend is
/// chosen at startup from the cache configuration and the platform globals.
#[derive(Clone)]
pub enum Cache {
    /// In-memory (per-process) store backed by Moka
    InMemory(memory::InMemoryCache),
    /// Redis-backed store, shared across workers
    Redis(redis::RedisCache),
    /// No-op store; sessions do not survive the request (tests only)
    Null(null::NullCache),
}

#[async_trait::async_trait]
impl CacheBackend for Cache {
    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        match self {
            Self::InMemory(cache) => cache.set(key, value).await,
            Self::Redis(cache) => cache.set(key, value).await,
            Self::Null(cache) => cache.set(key, value).await,
        }
    }

    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        match self {
            Self::InMemory(cache) => cache.get(key).await,
            Self::Redis(cache) => cache.get(key).await,
            Self::Null(cache) => cache.get(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match self {
            Self::InMemory(cache) => cache.delete(key).await,
            Self::Redis(cache) => cache.delete(key).await,
            Self::Null(cache) => cache.delete(key).await,
        }
    }

    async fn health_check(&self) -> Result<(), String> {
        match self {
            Self::InMemory(cache) => cache.health_check().await,
            Self::Redis(cache) => cache.health_check().await,
            Self::Null(cache) => cache.health_check().await,
        }
    }
}

/// Create the store backend selected by the configuration. The entry TTL is
/// the session duration; redis connection parameters come from the platform
/// globals unless an explicit URL override is configured.
pub async fn create_cache(
    config: &crate::config::AuthServerConfig,
    globals: &crate::config::Globals,
) -> Result<Cache, CacheError> {
    let ttl_secs = config.session_ttl_secs();
    match config.cache.store {
        crate::config::CacheStore::InMemory => {
            let cache = memory::InMemoryCache::new(ttl_secs, config.cache.memory.capacity)
                .map_err(CacheError::Config)?;
            Ok(Cache::InMemory(cache))
        }
        crate::config::CacheStore::Redis => {
            let url = if config.cache.redis.url.is_empty() {
                globals
                    .redis
                    .as_ref()
                    .map(|r| r.url())
                    .ok_or_else(|| {
                        CacheError::Config(
                            "redis store selected but no redis settings in globals".to_string(),
                        )
                    })?
            } else {
                config.cache.redis.url.clone()
            };
            let cache = redis::RedisCache::new(&url, ttl_secs)
                .await
                .map_err(CacheError::Config)?;
            Ok(Cache::Redis(cache))
        }
        crate::config::CacheStore::None => Ok(Cache::Null(null::NullCache::new())),
    }
}
