pub(crate) use crate::config::cache::{CacheConfig, CacheStore};
use confique::Config;
use serde::Deserialize;

pub mod cache;
pub mod globals;

pub use globals::{AuthMethodConfig, Globals, IdpType, RedisGlobals};

/// Deployment mode; production turns on `Secure` session cookies.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    #[default]
    Development,
    Production,
}

/// Main configuration structure for the authorization server
#[derive(Debug, Config, Clone)]
pub struct AuthServerConfig {
    /// The address the server binds to (default: 0.0.0.0)
    #[config(env = "AUTH_SERVER_HOST", default = "0.0.0.0")]
    pub host: String,

    /// The port the server listens on (default: 3010)
    #[config(env = "AUTH_SERVER_PORT", default = 3010)]
    pub port: u16,

    /// Path prefix under which all auth method routers are mounted
    #[config(env = "AUTH_SERVER_BASE_PATH", default = "/auth")]
    pub base_path: String,

    /// Session lifetime in minutes; also the TTL of session and profile
    /// store entries (default: 60)
    #[config(env = "AUTH_SERVER_SESSION_MINUTES", default = 60)]
    pub session_minutes: u32,

    /// Secret used to sign the session cookie. Required; there is no
    /// built-in default.
    #[config(env = "AUTH_SERVER_SESSION_SECRET")]
    pub session_secret: Option<String>,

    /// Path to the platform globals JSON file
    #[config(env = "AUTH_SERVER_GLOBALS_FILE", default = "globals.json")]
    pub globals_file: String,

    /// Deployment mode: "development" or "production"
    #[config(env = "AUTH_SERVER_MODE", default = "development")]
    pub mode: DeploymentMode,

    /// Timeout in seconds for portal API calls (default: 5)
    #[config(env = "AUTH_SERVER_PORTAL_TIMEOUT", default = 5)]
    pub portal_timeout: u64,

    /// Timeout in seconds for gateway calls (default: 5)
    #[config(env = "AUTH_SERVER_GATEWAY_TIMEOUT", default = 5)]
    pub gateway_timeout: u64,

    /// Cache configuration for the shared session/profile store
    #[config(nested)]
    pub cache: CacheConfig,
}

impl AuthServerConfig {
    /// Creates a new config instance from environment variables
    pub fn load() -> Result<Self, String> {
        let config = Self::builder().env().load().map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Session TTL in seconds
    pub fn session_ttl_secs(&self) -> u64 {
        u64::from(self.session_minutes) * 60
    }

    /// The session cookie signing secret; startup fails without one.
    pub fn session_secret(&self) -> Result<&str, String> {
        match self.session_secret.as_deref() {
            Some(secret) if secret.len() >= 32 => Ok(secret),
            Some(_) => Err("AUTH_SERVER_SESSION_SECRET must be at least 32 bytes".to_string()),
            None => Err("AUTH_SERVER_SESSION_SECRET is required".to_string()),
        }
    }

    fn validate(&self) -> Result<(), String> {
        self.session_secret()?;
        if self.session_minutes == 0 {
            return Err("AUTH_SERVER_SESSION_MINUTES must be positive".to_string());
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        use crate::config::cache::{InMemoryConfig, RedisConfig};
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            base_path: "/auth".to_string(),
            session_minutes: 60,
            session_secret: Some("0123456789abcdef0123456789abcdef".to_string()),
            globals_file: "globals.json".to_string(),
            mode: DeploymentMode::Development,
            portal_timeout: 5,
            gateway_timeout: 5,
            cache: CacheConfig {
                store: CacheStore::InMemory,
                memory: InMemoryConfig { capacity: 16 },
                redis: RedisConfig::default(),
            },
        }
    }
}
