//! Dummy identity provider: authenticates anyone as a configured user.
//! Useful for development setups and end-to-end tests of the flow
//! machinery without a real IdP.

use super::{IdentityProvider, IdpError, RefreshDecision, UiAuthorization};
use crate::config::IdpType;
use crate::session::{AuthResponse, OidcProfile};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DummyConfig {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    custom_id: Option<String>,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    registration_pool: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DummyIdp {
    config: DummyConfig,
}

impl DummyIdp {
    /// Build from the auth method's `config` object; `email` is required
    pub fn from_config(config: &serde_json::Value) -> Result<Self, String> {
        let config: DummyConfig = serde_json::from_value(config.clone())
            .map_err(|e| format!("invalid dummy provider config: {e}"))?;
        Ok(Self { config })
    }

    fn auth_response(&self) -> AuthResponse {
        let sub = self
            .config
            .user_id
            .clone()
            .or_else(|| self.config.custom_id.clone())
            .unwrap_or_else(|| self.config.email.clone());
        let profile = OidcProfile {
            sub,
            email: Some(self.config.email.clone()),
            email_verified: Some(true),
            name: self.config.name.clone(),
            ..Default::default()
        };
        AuthResponse {
            user_id: self.config.user_id.clone(),
            custom_id: self.config.custom_id.clone(),
            default_groups: self.config.groups.clone(),
            registration_pool: self.config.registration_pool.clone(),
            ..AuthResponse::new(profile)
        }
    }
}

#[async_trait]
impl IdentityProvider for DummyIdp {
    fn kind(&self) -> IdpType {
        IdpType::Dummy
    }

    async fn authorize_with_ui(&self) -> Result<UiAuthorization, IdpError> {
        // No interaction; the canned user is authenticated right away
        Ok(UiAuthorization::Authenticated(self.auth_response()))
    }

    async fn authorize_by_user_pass(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<AuthResponse, IdpError> {
        Ok(self.auth_response())
    }

    async fn check_refresh_token(
        &self,
        _profile: &OidcProfile,
    ) -> Result<RefreshDecision, IdpError> {
        Ok(RefreshDecision { allow: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_requires_email() {
        let err = DummyIdp::from_config(&serde_json::json!({})).unwrap_err();
        assert!(err.contains("invalid dummy provider config"));
    }

    #[tokio::test]
    async fn test_authorize_with_ui_is_immediate() {
        let idp = DummyIdp::from_config(&serde_json::json!({
            "userId": "u1",
            "email": "u1@ex",
            "groups": ["dev"]
        }))
        .unwrap();

        match idp.authorize_with_ui().await.unwrap() {
            UiAuthorization::Authenticated(response) => {
                assert_eq!(response.user_id.as_deref(), Some("u1"));
                assert_eq!(response.default_profile.sub, "u1");
                assert_eq!(response.default_groups, vec!["dev"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sub_falls_back_to_custom_id() {
        let idp = DummyIdp::from_config(&serde_json::json!({
            "customId": "ext:42",
            "email": "u2@ex"
        }))
        .unwrap();
        let response = idp.authorize_by_user_pass("x", "y").await.unwrap();
        assert_eq!(response.default_profile.sub, "ext:42");
        assert!(response.user_id.is_none());
    }
}
