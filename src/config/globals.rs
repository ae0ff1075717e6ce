//! Platform globals: the deployment-wide settings object shared by all
//! components of the portal. The authorization server only reads it.

use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// The platform globals object, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Globals {
    /// Base URL of the portal API (users, applications, subscriptions, ...)
    pub portal_api_url: String,
    /// Base URL of the gateway proxy; OAuth2 endpoints of an API live at
    /// `<apiUrl>/<apiUri>/oauth2/...`
    pub api_url: String,
    /// Base URL of the gateway admin API (plugin and API descriptors)
    pub gateway_admin_url: String,
    /// Externally visible URL of this authorization server
    pub external_url: String,
    /// Network schema the deployment runs on: "http" or "https"
    #[serde(default = "default_schema")]
    pub network_schema: String,
    /// Redis connection parameters, required when the cache store is redis
    #[serde(default)]
    pub redis: Option<RedisGlobals>,
    /// The configured auth methods, one OAuth2 router is mounted per entry
    #[serde(default)]
    pub auth_methods: Vec<AuthMethodConfig>,
}

fn default_schema() -> String {
    "http".to_string()
}

/// Redis connection parameters from the globals
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisGlobals {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_redis_port() -> u16 {
    6379
}

impl RedisGlobals {
    /// Assemble a redis connection URL from the individual parameters
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}/", password, self.host, self.port)
            }
            _ => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

/// The type of identity provider backing an auth method
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdpType {
    Local,
    Dummy,
    OAuth2,
    Saml,
    Twitter,
}

/// One configured auth method. Each enabled entry is mounted as its own
/// OAuth2 router under `/{name}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethodConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: IdpType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Globals {
    /// Load the globals object from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let file = File::open(path.as_ref()).map_err(|e| e.to_string())?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| e.to_string())
    }

    /// Enabled auth methods, in configuration order
    pub fn enabled_auth_methods(&self) -> impl Iterator<Item = &AuthMethodConfig> {
        self.auth_methods.iter().filter(|m| m.enabled)
    }

    #[cfg(test)]
    pub fn for_test(portal_api_url: &str, api_url: &str, gateway_admin_url: &str) -> Self {
        Self {
            portal_api_url: portal_api_url.to_string(),
            api_url: api_url.to_string(),
            gateway_admin_url: gateway_admin_url.to_string(),
            external_url: "http://localhost:3010/auth".to_string(),
            network_schema: "http".to_string(),
            redis: None,
            auth_methods: vec![
                AuthMethodConfig {
                    name: "local".to_string(),
                    kind: IdpType::Local,
                    config: serde_json::Value::Null,
                    enabled: true,
                },
                AuthMethodConfig {
                    name: "dummy".to_string(),
                    kind: IdpType::Dummy,
                    config: serde_json::json!({
                        "userId": "u1",
                        "email": "u1@ex",
                    }),
                    enabled: true,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_globals() {
        let json = serde_json::json!({
            "portalApiUrl": "http://portal-api:3001",
            "apiUrl": "https://api.example.com",
            "gatewayAdminUrl": "http://gateway:8001",
            "externalUrl": "https://api.example.com/auth",
            "networkSchema": "https",
            "redis": { "host": "redis", "port": 6379, "password": "secret" },
            "authMethods": [
                { "name": "local", "type": "local" },
                { "name": "corp", "type": "saml", "enabled": false }
            ]
        });
        let globals: Globals = serde_json::from_value(json).unwrap();
        assert_eq!(globals.network_schema, "https");
        assert_eq!(globals.auth_methods.len(), 2);
        assert_eq!(globals.enabled_auth_methods().count(), 1);
        assert_eq!(
            globals.redis.unwrap().url(),
            "redis://:secret@redis:6379/"
        );
    }

    #[test]
    fn test_redis_url_without_password() {
        let redis = RedisGlobals {
            host: "localhost".to_string(),
            port: 6380,
            password: None,
        };
        assert_eq!(redis.url(), "redis://localhost:6380/");
    }
}
