use confique::Config;
use serde::Deserialize;

/// Specifies which backend holds sessions and token profiles
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStore {
    #[default]
    InMemory,
    Redis,
    #[serde(other)]
    None,
}

/// Configuration for the shared key-value store backing the session
/// store and the profile store
#[derive(Debug, Config, Clone, Default)]
pub struct CacheConfig {
    /// Store type: "in-memory" (default) or "redis". The redis connection
    /// parameters come from the platform globals.
    #[config(env = "AUTH_SERVER_CACHE_STORE", default = "in-memory")]
    pub store: CacheStore,

    /// In-memory store specific configuration
    #[config(nested)]
    pub memory: InMemoryConfig,

    /// Redis store specific configuration
    #[config(nested)]
    pub redis: RedisConfig,
}

/// In-memory store configuration options
#[derive(Debug, Config, Clone, Default)]
pub struct InMemoryConfig {
    /// Maximum capacity in MiB (default: 64 MiB)
    #[config(env = "AUTH_SERVER_CACHE_MEMORY_CAPACITY", default = 64)]
    pub capacity: usize,
}

/// Redis store configuration options
#[derive(Debug, Config, Clone, Default)]
pub struct RedisConfig {
    /// Redis connection string override; when empty the URL is assembled
    /// from the globals' redis host/port/password
    #[config(env = "AUTH_SERVER_CACHE_REDIS_URL", default = "")]
    pub url: String,
}
