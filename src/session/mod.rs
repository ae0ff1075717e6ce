//! Per-browser session state. The session id lives in a signed cookie;
//! the session record lives in the shared key-value store under
//! `session:<sid>` and expires with the session TTL. Each auth method
//! keeps its own `AuthRequest`/`AuthResponse` slot inside the record, so
//! one browser session can hold logins with several auth methods.

use crate::cache::{Cache, CacheBackend, CacheError};
use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::warn;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

pub use crate::gateway::models::ResponseType;

/// Name of the signed session cookie
pub const SESSION_COOKIE_NAME: &str = "portal-auth.cookie.sid";

/// OIDC-style user profile; `sub` is the only required claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OidcProfile {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Prompt values of the authorize call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prompt {
    None,
    Login,
}

/// The validated authorize request of one auth method within a session.
/// Created at the start of an authorize call, mutated only by the flow,
/// destroyed on session destroy or on replacement by a new authorize call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub api_id: String,
    pub client_id: String,
    pub response_type: ResponseType,
    pub redirect_uri: String,
    #[serde(default)]
    pub state: Option<String>,
    /// Always a validated list of scope names after request validation
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub prompt: Option<Prompt>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Trusted subscriptions get the API's full scope set without consent
    #[serde(default)]
    pub trusted: bool,
    /// Whether the effective scope differs from the requested one
    #[serde(default)]
    pub scopes_differ: bool,
    /// Plain login mode: no gateway involvement, just authenticate and
    /// return to the redirect URI
    #[serde(default)]
    pub plain: bool,
    pub app_id: String,
    #[serde(default)]
    pub valid_namespaces: Option<Vec<String>>,
}

/// What the identity provider (and later the user reconciliation and
/// registration steps) know about the authenticated end user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Portal user id; `None` until reconciled, and stays `None` for
    /// passthrough APIs
    #[serde(default)]
    pub user_id: Option<String>,
    /// IdP-assigned identity, e.g. "github:12345"
    #[serde(default)]
    pub custom_id: Option<String>,
    pub default_profile: OidcProfile,
    #[serde(default)]
    pub default_groups: Vec<String>,
    #[serde(default)]
    pub registration_pool: Option<String>,
    /// The effective profile after registration processing
    #[serde(default)]
    pub profile: Option<OidcProfile>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

impl AuthResponse {
    pub fn new(default_profile: OidcProfile) -> Self {
        Self {
            user_id: None,
            custom_id: None,
            default_profile,
            default_groups: Vec::new(),
            registration_pool: None,
            profile: None,
            groups: None,
        }
    }
}

/// Transient record of a running consent interaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantProcessInfo {
    pub missing_grants: Vec<String>,
    pub existing_grants: Vec<crate::portal::models::ScopeGrant>,
}

/// Last error remembered for the failure page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredError {
    pub message: String,
    pub status: u16,
}

/// Per-auth-method slot inside a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodSession {
    #[serde(default)]
    pub auth_request: Option<AuthRequest>,
    #[serde(default)]
    pub auth_response: Option<AuthResponse>,
    #[serde(default)]
    pub grant_info: Option<GrantProcessInfo>,
    /// Nonce guarding the registration form round-trip
    #[serde(default)]
    pub registration_nonce: Option<String>,
}

impl MethodSession {
    /// A method slot counts as logged in once it holds an auth response
    /// whose effective profile has a non-empty subject
    pub fn is_logged_in(&self) -> bool {
        self.auth_response
            .as_ref()
            .and_then(|r| r.profile.as_ref())
            .map(|p| !p.sub.is_empty())
            .unwrap_or(false)
    }
}

/// The session record stored under `session:<sid>`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    /// Single-use CSRF token for state-mutating form posts
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub last_error: Option<StoredError>,
    /// Last known client redirect URI, used by the failure page
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub methods: HashMap<String, MethodSession>,
}

impl SessionData {
    pub fn method(&self, method_id: &str) -> Option<&MethodSession> {
        self.methods.get(method_id)
    }

    pub fn method_mut(&mut self, method_id: &str) -> &mut MethodSession {
        self.methods.entry(method_id.to_string()).or_default()
    }

    /// Mint a fresh CSRF token, replacing any previous one
    pub fn issue_csrf_token(&mut self) -> String {
        let token = random_token();
        self.csrf_token = Some(token.clone());
        token
    }

    /// Compare and consume the CSRF token; it is single-use either way
    pub fn consume_csrf_token(&mut self, presented: &str) -> bool {
        match self.csrf_token.take() {
            Some(expected) => !presented.is_empty() && expected == presented,
            None => false,
        }
    }
}

/// A loaded session together with its id
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub sid: String,
    pub data: SessionData,
}

/// Store for session records, on top of the shared key-value store
#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<Cache>,
}

impl SessionStore {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    fn key(sid: &str) -> String {
        format!("session:{sid}")
    }

    /// Load the session referenced by the cookie jar, or start a fresh one
    pub async fn load_or_new(&self, jar: &SignedCookieJar) -> Result<SessionHandle, CacheError> {
        if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
            let sid = cookie.value().to_string();
            if let Some(data) = self.cache.get::<SessionData>(&Self::key(&sid)).await? {
                return Ok(SessionHandle { sid, data });
            }
            // Expired or unknown sid: reuse the id, start over with empty data
            return Ok(SessionHandle {
                sid,
                data: SessionData::default(),
            });
        }
        Ok(SessionHandle {
            sid: Uuid::new_v4().to_string(),
            data: SessionData::default(),
        })
    }

    /// Load an existing session; `None` when the cookie or record is gone
    pub async fn load(&self, jar: &SignedCookieJar) -> Result<Option<SessionHandle>, CacheError> {
        let Some(cookie) = jar.get(SESSION_COOKIE_NAME) else {
            return Ok(None);
        };
        let sid = cookie.value().to_string();
        Ok(self
            .cache
            .get::<SessionData>(&Self::key(&sid))
            .await?
            .map(|data| SessionHandle { sid, data }))
    }

    /// Persist a session record; must happen before the response is written
    pub async fn save(&self, handle: &SessionHandle) -> Result<(), CacheError> {
        self.cache.set(&Self::key(&handle.sid), &handle.data).await
    }

    /// Destroy a session record; best effort
    pub async fn destroy(&self, sid: &str) {
        if let Err(e) = self.cache.delete(&Self::key(sid)).await {
            warn!("Failed to destroy session {sid}: {e}");
        }
    }
}

/// Build the signed session cookie for a session id
pub fn session_cookie(sid: &str, secure: bool, max_age_secs: u64) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE_NAME, sid.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(max_age_secs as i64))
        .build()
}

/// Random URL-safe token for CSRF and registration nonces
pub fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryCache;

    fn store() -> SessionStore {
        let cache = Cache::InMemory(InMemoryCache::new(60, 16).unwrap());
        SessionStore::new(Arc::new(cache))
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let store = store();
        let mut handle = SessionHandle {
            sid: "abc".to_string(),
            data: SessionData::default(),
        };
        handle.data.method_mut("local").auth_request = Some(AuthRequest {
            api_id: "api1".to_string(),
            client_id: "CID".to_string(),
            response_type: ResponseType::Code,
            redirect_uri: "https://c.example/cb".to_string(),
            state: Some("xyz".to_string()),
            scope: vec!["read".to_string()],
            prompt: None,
            namespace: None,
            trusted: false,
            scopes_differ: false,
            plain: false,
            app_id: "app1".to_string(),
            valid_namespaces: None,
        });
        store.save(&handle).await.unwrap();

        let loaded: SessionData = store
            .cache
            .get(&SessionStore::key("abc"))
            .await
            .unwrap()
            .unwrap();
        let request = loaded
            .method("local")
            .and_then(|m| m.auth_request.as_ref())
            .unwrap();
        assert_eq!(request.api_id, "api1");
        assert_eq!(request.scope, vec!["read"]);
    }

    #[tokio::test]
    async fn test_destroy_removes_record() {
        let store = store();
        let handle = SessionHandle {
            sid: "gone".to_string(),
            data: SessionData::default(),
        };
        store.save(&handle).await.unwrap();
        store.destroy("gone").await;
        let loaded: Option<SessionData> =
            store.cache.get(&SessionStore::key("gone")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_csrf_token_is_single_use() {
        let mut data = SessionData::default();
        let token = data.issue_csrf_token();
        assert!(data.consume_csrf_token(&token));
        // Second use fails, the token is gone
        assert!(!data.consume_csrf_token(&token));
    }

    #[test]
    fn test_csrf_token_mismatch() {
        let mut data = SessionData::default();
        let _ = data.issue_csrf_token();
        assert!(!data.consume_csrf_token("forged"));
        // A failed attempt also burns the token
        assert!(data.csrf_token.is_none());
    }

    #[test]
    fn test_logged_in_requires_profile_sub() {
        let mut method = MethodSession::default();
        assert!(!method.is_logged_in());

        let mut response = AuthResponse::new(OidcProfile {
            sub: "u1".to_string(),
            ..Default::default()
        });
        method.auth_response = Some(response.clone());
        // Only the default profile is set, the effective profile is not
        assert!(!method.is_logged_in());

        response.profile = Some(OidcProfile {
            sub: "u1".to_string(),
            ..Default::default()
        });
        method.auth_response = Some(response);
        assert!(method.is_logged_in());
    }
}
