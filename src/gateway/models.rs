//! Wire models for the gateway's admin API and its OAuth2 plugin endpoints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OAuth2 response types supported on the authorize endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Code,
    Token,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Token => "token",
        }
    }
}

/// Parameters for the gateway authorize call. The provision key is
/// injected by the client from the cached plugin configuration.
#[derive(Debug, Clone)]
pub struct AuthorizeParams {
    pub response_type: ResponseType,
    pub client_id: String,
    pub redirect_uri: String,
    pub authenticated_userid: String,
    pub scope: Vec<String>,
}

/// The gateway's answer to an authorize call: the redirect to send the
/// user agent to, carrying the code or token
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
    pub redirect_uri: String,
}

/// Parameters for the gateway token call, one variant per grant type.
/// The body shape differs per grant; the client serializes accordingly.
#[derive(Debug, Clone)]
pub enum TokenParams {
    ClientCredentials {
        client_id: String,
        client_secret: String,
        scope: Vec<String>,
    },
    AuthorizationCode {
        client_id: String,
        client_secret: String,
        code: String,
        redirect_uri: String,
    },
    Password {
        client_id: String,
        client_secret: Option<String>,
        authenticated_userid: String,
        scope: Vec<String>,
    },
    RefreshToken {
        client_id: String,
        client_secret: Option<String>,
        refresh_token: String,
    },
}

impl TokenParams {
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::ClientCredentials { .. } => "client_credentials",
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::Password { .. } => "password",
            Self::RefreshToken { .. } => "refresh_token",
        }
    }
}

/// Token response passed through from the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Any additional fields the gateway returns are passed through
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// OAuth2 plugin configuration of one API, as served by the gateway
/// admin API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuth2PluginConfig {
    #[serde(default)]
    pub provision_key: Option<String>,
    #[serde(default)]
    pub enable_authorization_code: bool,
    #[serde(default)]
    pub enable_implicit_grant: bool,
    #[serde(default)]
    pub enable_client_credentials: bool,
    #[serde(default)]
    pub enable_password_grant: bool,
}

/// One plugin entry from the admin API's plugin listing
#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Plugin listing wrapper
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginList {
    #[serde(default)]
    pub data: Vec<PluginEntry>,
}

/// Gateway API descriptor; only the routing URIs matter here
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayApiDescriptor {
    #[serde(default)]
    pub uris: Vec<String>,
}

/// Resolved, cached gateway configuration of one API: plugin settings
/// plus the URI the API is routed under. Effectively immutable for the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct ApiGatewayConfig {
    pub provision_key: String,
    pub uri: String,
    pub enable_authorization_code: bool,
    pub enable_implicit_grant: bool,
    pub enable_client_credentials: bool,
    pub enable_password_grant: bool,
}

/// Error body the gateway returns on failed OAuth2 calls
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}
