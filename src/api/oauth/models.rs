//! Wire models of the OAuth2 surface: authorize query, token request
//! (form or JSON), token response, and the error body.

use axum::{
    async_trait,
    extract::{Form, FromRequest, Request},
    http::header::CONTENT_TYPE,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Query parameters of the authorize endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeQuery {
    #[serde(default)]
    pub response_type: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Space-separated scope names
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Token request fields across all grant types
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TokenRequestBody {
    pub grant_type: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Authorization code (authorization_code grant)
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Resource owner credentials (password grant)
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Space-separated scope names
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenRequestBody {
    /// Requested scope as a list
    pub fn scope_list(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(|p| p.to_string()).collect())
            .unwrap_or_default()
    }
}

/// Extractor accepting the token request as form data (the OAuth2
/// default) or as a JSON body
pub struct TokenRequestExtractor(pub TokenRequestBody);

#[async_trait]
impl<S> FromRequest<S> for TokenRequestExtractor
where
    S: Send + Sync,
{
    type Rejection = super::error::FlowError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .unwrap_or("");

        if content_type.starts_with("application/json") {
            match Json::<TokenRequestBody>::from_request(req, state).await {
                Ok(Json(body)) => Ok(TokenRequestExtractor(body)),
                Err(_) => Err(super::error::FlowError::json(
                    super::error::OAuthErrorKind::InvalidRequest,
                    "Invalid JSON in request body",
                )),
            }
        } else {
            match Form::<TokenRequestBody>::from_request(req, state).await {
                Ok(Form(body)) => Ok(TokenRequestExtractor(body)),
                Err(_) => Err(super::error::FlowError::json(
                    super::error::OAuthErrorKind::InvalidRequest,
                    "Invalid form data in request body",
                )),
            }
        }
    }
}

/// Token response, as documented; the handler passes the gateway's
/// response through verbatim
#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// OAuth2 error body
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OAuthErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// Login form fields
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub csrf_token: String,
}

/// Consent form fields; action is "allow" or "deny"
#[derive(Debug, Deserialize)]
pub struct GrantForm {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub csrf_token: String,
}

/// Namespace selection form fields
#[derive(Debug, Deserialize)]
pub struct SelectNamespaceForm {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub csrf_token: String,
}

/// Registration form fields; arbitrary pool attributes ride along
#[derive(Debug, Deserialize)]
pub struct RegisterForm {
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Verification completion form
#[derive(Debug, Deserialize)]
pub struct VerifyForm {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub csrf_token: String,
}

/// Email form shared by /verifyemail and /forgotpassword
#[derive(Debug, Deserialize)]
pub struct EmailForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub csrf_token: String,
}

/// Grant revocation form of the grant manager
#[derive(Debug, Deserialize)]
pub struct RevokeGrantForm {
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub api_id: String,
    #[serde(default)]
    pub csrf_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_list_splits_on_whitespace() {
        let body: TokenRequestBody = serde_json::from_value(serde_json::json!({
            "grant_type": "client_credentials",
            "scope": "read  write"
        }))
        .unwrap();
        assert_eq!(body.scope_list(), vec!["read", "write"]);
    }

    #[test]
    fn test_scope_list_empty_when_missing() {
        let body: TokenRequestBody = serde_json::from_value(serde_json::json!({
            "grant_type": "refresh_token"
        }))
        .unwrap();
        assert!(body.scope_list().is_empty());
    }
}
