//! Local identity provider: username/password against the portal's user
//! store. The portal owns users and password hashes, so credential checks
//! are delegated there; this adapter only shapes the result.

use super::{IdentityProvider, IdpError, RefreshDecision, UiAuthorization};
use crate::config::IdpType;
use crate::portal::models::PortalUser;
use crate::portal::PortalClient;
use crate::session::{AuthResponse, OidcProfile};
use async_trait::async_trait;
use log::debug;

#[derive(Clone, Debug)]
pub struct LocalIdp {
    portal: PortalClient,
}

impl LocalIdp {
    pub fn new(portal: PortalClient) -> Self {
        Self { portal }
    }

    fn auth_response_for(user: PortalUser) -> AuthResponse {
        let profile = OidcProfile {
            sub: user.id.clone(),
            email: Some(user.email.clone()),
            email_verified: Some(user.validated),
            ..Default::default()
        };
        AuthResponse {
            user_id: Some(user.id),
            custom_id: user.custom_id,
            default_groups: user.groups,
            ..AuthResponse::new(profile)
        }
    }
}

#[async_trait]
impl IdentityProvider for LocalIdp {
    fn kind(&self) -> IdpType {
        IdpType::Local
    }

    async fn authorize_with_ui(&self) -> Result<UiAuthorization, IdpError> {
        // Interactive authentication happens on the method's own login page
        Ok(UiAuthorization::Redirect("login".to_string()))
    }

    async fn authorize_by_user_pass(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthResponse, IdpError> {
        debug!("Local login attempt for {username}");
        let user = self.portal.login(username, password).await?;
        Ok(Self::auth_response_for(user))
    }

    async fn check_refresh_token(
        &self,
        profile: &OidcProfile,
    ) -> Result<RefreshDecision, IdpError> {
        // Local users may refresh as long as the portal user still exists;
        // the flow verifies existence separately
        debug!("Refresh check for sub {}", profile.sub);
        Ok(RefreshDecision { allow: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_login_builds_auth_response() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u1",
                "email": "u1@ex",
                "validated": true,
                "groups": ["dev"]
            })))
            .mount(&mock)
            .await;

        let idp = LocalIdp::new(PortalClient::new(mock.uri(), Client::new()));
        let response = idp.authorize_by_user_pass("u1@ex", "pw").await.unwrap();
        assert_eq!(response.user_id.as_deref(), Some("u1"));
        assert_eq!(response.default_profile.sub, "u1");
        assert_eq!(response.default_profile.email.as_deref(), Some("u1@ex"));
        assert_eq!(response.default_profile.email_verified, Some(true));
        assert_eq!(response.default_groups, vec!["dev"]);
        assert!(response.profile.is_none());
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;

        let idp = LocalIdp::new(PortalClient::new(mock.uri(), Client::new()));
        let err = idp.authorize_by_user_pass("u1@ex", "nope").await.unwrap_err();
        assert!(matches!(err, IdpError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_ui_authorization_redirects_to_login() {
        let idp = LocalIdp::new(PortalClient::new(
            "http://localhost:3001".to_string(),
            Client::new(),
        ));
        match idp.authorize_with_ui().await.unwrap() {
            UiAuthorization::Redirect(path) => assert_eq!(path, "login"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
