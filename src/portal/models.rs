//! Wire models of the portal API resources consumed by this server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Subscription lookup result: the subscription plus the owning application
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub subscription: Subscription,
    pub application: Application,
}

/// An application's subscription to an API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// The API this subscription is for
    pub api: String,
    /// The owning application id
    pub application: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Trusted subscriptions bypass consent and may use the password grant
    #[serde(default)]
    pub trusted: bool,
}

/// Portal application record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Confidential applications must authenticate with their client secret
    #[serde(default)]
    pub confidential: bool,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

impl Application {
    /// All registered redirect URIs, regardless of which field the portal
    /// used to store them
    pub fn all_redirect_uris(&self) -> Vec<&str> {
        let mut uris: Vec<&str> = self.redirect_uris.iter().map(String::as_str).collect();
        if let Some(uri) = self.redirect_uri.as_deref() {
            if !uris.contains(&uri) {
                uris.push(uri);
            }
        }
        uris
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Portal API descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Auth method ids allowed to authorize for this API
    #[serde(default)]
    pub auth_methods: Vec<String>,
    /// Registration pool users must be registered in before token issuance
    #[serde(default)]
    pub registration_pool: Option<String>,
    /// Passthrough APIs do not maintain portal users; identity is forwarded
    /// verbatim to the gateway
    #[serde(default)]
    pub passthrough_users: bool,
    /// External service resolving the final scope and authenticated user id
    #[serde(default)]
    pub passthrough_scope_url: Option<String>,
    #[serde(default)]
    pub settings: ApiSettings,
}

impl ApiInfo {
    /// The scope names this API recognizes, in stable order
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.settings.scopes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Scope catalogue: scope name to its description
    #[serde(default)]
    pub scopes: HashMap<String, ScopeDescription>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeDescription {
    #[serde(default)]
    pub description: Option<String>,
}

/// Portal user record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub custom_id: Option<String>,
}

/// Payload for creating a portal user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    pub validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Partial user update; only present fields are patched
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<bool>,
}

/// A user's registration in a pool; the portal stores arbitrary
/// user-supplied attributes alongside the known fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub data: HashMap<String, serde_json::Value>,
}

/// Collection wrapper the portal uses for registration lists
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationCollection {
    #[serde(default)]
    pub items: Vec<Registration>,
}

/// Registration pool descriptor
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// When set, every registration must carry a namespace
    #[serde(default)]
    pub requires_namespace: bool,
    /// When set, users cannot self-register; membership is managed elsewhere
    #[serde(default)]
    pub disable_register: bool,
}

/// A namespace within a registration pool
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolNamespace {
    pub namespace: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Scope grant of a user for one (application, API) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGrant {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub application_id: Option<String>,
    #[serde(default)]
    pub api_id: Option<String>,
    #[serde(default)]
    pub grants: Vec<ScopeGrant>,
}

impl ApiGrant {
    /// Whether the given scope is part of this grant
    pub fn has_scope(&self, scope: &str) -> bool {
        self.grants.iter().any(|g| g.scope == scope)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeGrant {
    pub scope: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrantCollection {
    #[serde(default)]
    pub items: Vec<ApiGrant>,
}

/// Verification kinds: email confirmation and password reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationType {
    Email,
    LostPassword,
}

/// An email or password-reset verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: VerificationType,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Link template the portal mailer embeds in the verification email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}
