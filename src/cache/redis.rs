use super::{CacheBackend, CacheError};
use async_trait::async_trait;
use log::error;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};

/// Redis-backed store. All workers of a deployment point at the same
/// instance, so a session or token profile written by one worker is
/// visible to the others.
#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
    ttl_secs: u64,
}

impl RedisCache {
    /// Connect to redis and verify the connection with a PING
    pub async fn new(redis_url: &str, ttl_secs: u64) -> Result<Self, String> {
        let client = Client::open(redis_url)
            .map_err(|err| format!("Failed to connect to Redis: {err}"))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|err| format!("Failed to create Redis connection manager: {err}"))?;

        let mut conn = conn_manager.clone();
        if let Err(err) = redis::cmd("PING").query_async::<String>(&mut conn).await {
            return Err(format!("Failed to ping Redis: {err}"));
        }

        Ok(Self {
            conn_manager,
            ttl_secs,
        })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        let serialized = serde_json::to_string(value)?;
        let mut conn = self.conn_manager.clone();

        match conn
            .set_ex::<_, _, ()>(key, serialized, self.ttl_secs)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!("Redis error while setting key {key}: {err}");
                Err(CacheError::Redis(err.to_string()))
            }
        }
    }

    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn_manager.clone();

        let result: Option<String> = match conn.get(key).await {
            Ok(value) => value,
            Err(err) => {
                if err.kind() == redis::ErrorKind::TypeError {
                    // Key does not exist
                    return Ok(None);
                }
                error!("Redis error while getting key {key}: {err}");
                return Err(CacheError::Redis(err.to_string()));
            }
        };

        if let Some(value) = result {
            serde_json::from_str(&value)
                .map_err(|e| CacheError::Deserialization(e.to_string()))
                .map(Some)
        } else {
            Ok(None)
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();

        match conn.del::<_, ()>(key).await {
            Ok(_) => Ok(()),
            Err(err) => {
                error!("Redis error while deleting key {key}: {err}");
                Err(CacheError::Redis(err.to_string()))
            }
        }
    }

    async fn health_check(&self) -> Result<(), String> {
        let mut conn = self.conn_manager.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => Ok(()),
            Err(err) => Err(format!("Redis health check failed: {err}")),
        }
    }
}
