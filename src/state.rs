use crate::{
    cache::Cache,
    config::{AuthMethodConfig, AuthServerConfig, Globals},
    gateway::GatewayClient,
    idp::IdentityProvider,
    portal::PortalClient,
    profile::ProfileStore,
    session::SessionStore,
};
use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Shared resources of the authorization server. Cloned into every
/// handler; all members are cheap handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AuthServerConfig>,
    pub globals: Arc<Globals>,
    pub cache: Arc<Cache>,
    pub sessions: SessionStore,
    pub profiles: ProfileStore,
    pub portal: PortalClient,
    pub gateway: GatewayClient,
    /// Plain HTTP client for externally configured endpoints, e.g. the
    /// passthrough scope resolver
    pub http: Client,
    cookie_key: Key,
}

impl AppState {
    /// Create the application state around a pre-initialized store backend
    pub fn with_existing_cache(
        config: &AuthServerConfig,
        globals: &Globals,
        cache: Cache,
    ) -> Result<Self, String> {
        let secret = config.session_secret()?;
        let cookie_key = Key::derive_from(secret.as_bytes());

        let cache = Arc::new(cache);
        let sessions = SessionStore::new(cache.clone());
        let profiles = ProfileStore::new(cache.clone());

        let portal = PortalClient::new(
            globals.portal_api_url.clone(),
            create_http_client(config.portal_timeout),
        );
        let gateway = GatewayClient::new(
            globals.gateway_admin_url.clone(),
            globals.api_url.clone(),
            create_http_client(config.gateway_timeout),
            config.gateway_timeout,
        )?;

        Ok(Self {
            config: Arc::new(config.clone()),
            globals: Arc::new(globals.clone()),
            cache,
            sessions,
            profiles,
            portal,
            gateway,
            http: create_http_client(config.portal_timeout),
            cookie_key,
        })
    }

    /// State for tests: in-memory store, short timeouts
    #[cfg(test)]
    pub fn for_testing(config: &AuthServerConfig, globals: &Globals) -> Self {
        let cache = Cache::InMemory(
            crate::cache::memory::InMemoryCache::new(config.session_ttl_secs(), 16)
                .expect("Failed to create test cache"),
        );
        Self::with_existing_cache(config, globals, cache)
            .expect("Failed to create test application state")
    }
}

/// Signing key for the session cookie jar
impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Key {
        state.cookie_key.clone()
    }
}

/// Per-auth-method state: the shared application state plus the method's
/// configuration and identity provider. One instance per mounted router.
#[derive(Clone)]
pub struct MethodState {
    pub app: AppState,
    pub method: Arc<AuthMethodConfig>,
    pub idp: Arc<dyn IdentityProvider>,
}

impl MethodState {
    pub fn new(app: AppState, method: Arc<AuthMethodConfig>, idp: Arc<dyn IdentityProvider>) -> Self {
        Self { app, method, idp }
    }

    /// The auth method id this router serves, e.g. "local"
    pub fn method_id(&self) -> &str {
        &self.method.name
    }
}

impl FromRef<MethodState> for Key {
    fn from_ref(state: &MethodState) -> Key {
        Key::from_ref(&state.app)
    }
}

/// Creates a configured HTTP client with default headers and timeouts
fn create_http_client(timeout_secs: u64) -> Client {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(5))
        .default_headers(headers)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .build()
        .expect("Failed to create HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_state_creation() {
        let config = AuthServerConfig::for_test();
        let globals = Globals::for_test(
            "http://localhost:3001",
            "http://localhost:8000",
            "http://localhost:8001",
        );
        let state = AppState::for_testing(&config, &globals);

        assert_eq!(state.config.session_minutes, config.session_minutes);
        assert_eq!(state.globals.portal_api_url, globals.portal_api_url);
    }

    #[tokio::test]
    async fn test_app_state_clone_shares_resources() {
        let config = AuthServerConfig::for_test();
        let globals = Globals::for_test(
            "http://localhost:3001",
            "http://localhost:8000",
            "http://localhost:8001",
        );
        let state = AppState::for_testing(&config, &globals);
        let state2 = state.clone();

        assert_eq!(Arc::as_ptr(&state.config), Arc::as_ptr(&state2.config));
        assert_eq!(Arc::as_ptr(&state.cache), Arc::as_ptr(&state2.cache));
    }
}
