//! Identity provider capability. An auth method is a named, typed IdP
//! instance; the OAuth2 router drives authentication exclusively through
//! this trait. Local (portal-backed username/password) and dummy
//! (canned profile) providers ship with the server; federated variants
//! are recognized in the configuration but provided externally.

use crate::config::{AuthMethodConfig, IdpType};
use crate::portal::{PortalClient, PortalError};
use crate::session::{AuthResponse, OidcProfile};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod dummy;
pub mod local;

/// Errors surfaced by identity providers
#[derive(Debug, Error)]
pub enum IdpError {
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("Identity provider error: {0}")]
    Upstream(String),
    #[error("Operation not supported by this identity provider: {0}")]
    NotSupported(&'static str),
}

impl From<PortalError> for IdpError {
    fn from(err: PortalError) -> Self {
        match err {
            PortalError::InvalidCredentials => IdpError::InvalidCredentials,
            other => IdpError::Upstream(other.to_string()),
        }
    }
}

/// Outcome of starting interactive authentication
#[derive(Debug, Clone)]
pub enum UiAuthorization {
    /// Send the user agent to a login page; the path is relative to the
    /// auth method's router mount
    Redirect(String),
    /// The provider authenticated the user without interaction
    Authenticated(AuthResponse),
}

/// Decision on whether a refresh may proceed for a previously
/// authenticated user
#[derive(Debug, Clone)]
pub struct RefreshDecision {
    pub allow: bool,
}

/// The endpoints an auth method exposes, advertised to the portal UI
#[derive(Debug, Clone)]
pub struct IdpEndpoints {
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub profile_endpoint: String,
}

/// The capability every identity provider adapter implements
#[async_trait]
pub trait IdentityProvider: Send + Sync + std::fmt::Debug {
    /// The provider type backing this auth method
    fn kind(&self) -> IdpType;

    /// Endpoints of the method mounted at `{external_url}/{method_id}`
    fn endpoints(&self, external_url: &str, method_id: &str) -> IdpEndpoints {
        let base = format!("{}/{}", external_url.trim_end_matches('/'), method_id);
        IdpEndpoints {
            authorize_endpoint: format!("{base}/api/:apiId/authorize"),
            token_endpoint: format!("{base}/api/:apiId/token"),
            profile_endpoint: format!("{base}/profile"),
        }
    }

    /// Begin interactive end-user authentication
    async fn authorize_with_ui(&self) -> Result<UiAuthorization, IdpError>;

    /// Headless username/password authentication, used by the resource
    /// owner password grant and the login form
    async fn authorize_by_user_pass(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthResponse, IdpError>;

    /// Whether a refresh for this user may proceed
    async fn check_refresh_token(&self, profile: &OidcProfile) -> Result<RefreshDecision, IdpError>;
}

/// Instantiate the identity provider for a configured auth method
pub fn create_identity_provider(
    method: &AuthMethodConfig,
    portal: &PortalClient,
) -> Result<Arc<dyn IdentityProvider>, String> {
    match method.kind {
        IdpType::Local => Ok(Arc::new(local::LocalIdp::new(portal.clone()))),
        IdpType::Dummy => Ok(Arc::new(dummy::DummyIdp::from_config(&method.config)
            .map_err(|e| format!("auth method {}: {e}", method.name))?)),
        other => Err(format!(
            "auth method {}: identity provider type {other:?} is not available",
            method.name
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;

    #[test]
    fn test_factory_rejects_unavailable_types() {
        let portal = PortalClient::new("http://localhost:3001".to_string(), Client::new());
        let method = AuthMethodConfig {
            name: "corp".to_string(),
            kind: IdpType::Saml,
            config: serde_json::Value::Null,
            enabled: true,
        };
        let err = create_identity_provider(&method, &portal).unwrap_err();
        assert!(err.contains("corp"));
        assert!(err.contains("not available"));
    }

    #[test]
    fn test_endpoints_are_mounted_under_method() {
        let portal = PortalClient::new("http://localhost:3001".to_string(), Client::new());
        let idp = local::LocalIdp::new(portal);
        let endpoints = idp.endpoints("https://api.example.com/auth/", "local");
        assert_eq!(
            endpoints.authorize_endpoint,
            "https://api.example.com/auth/local/api/:apiId/authorize"
        );
        assert_eq!(
            endpoints.profile_endpoint,
            "https://api.example.com/auth/local/profile"
        );
    }
}
