//! Profile store: binds issued authorization codes and tokens to the user
//! profile captured at authorize time. Entries live in the shared
//! key-value store and expire with the session TTL; an expired entry is
//! never fatal, callers surface it as an invalid token.

use crate::cache::{Cache, CacheBackend, CacheError};
use crate::gateway::models::GatewayTokenResponse;
use crate::session::OidcProfile;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stored binding of a code or token to a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub api_id: String,
    pub profile: OidcProfile,
    /// On refresh token entries: the access token issued alongside, so a
    /// passthrough refresh can retire it
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Store for code/token profile bindings
#[derive(Clone)]
pub struct ProfileStore {
    cache: Arc<Cache>,
}

impl ProfileStore {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    fn key(token_or_code: &str) -> String {
        format!("profile:{token_or_code}")
    }

    /// Register a profile under a single key, an authorization code or a
    /// bare access token. Must complete before the response carrying the
    /// key is written.
    pub async fn register_token_or_code(
        &self,
        token_or_code: &str,
        api_id: &str,
        profile: &OidcProfile,
    ) -> Result<(), CacheError> {
        debug!("Registering code/token binding for sub {}", profile.sub);
        self.cache
            .set(
                &Self::key(token_or_code),
                &ProfileEntry {
                    api_id: api_id.to_string(),
                    profile: profile.clone(),
                    access_token: None,
                },
            )
            .await
    }

    /// Register a profile under a token response: the access token and,
    /// when present, the refresh token both map to the same profile.
    pub async fn register_token(
        &self,
        token: &GatewayTokenResponse,
        api_id: &str,
        profile: &OidcProfile,
    ) -> Result<(), CacheError> {
        debug!("Registering access token for sub {}", profile.sub);
        let entry = ProfileEntry {
            api_id: api_id.to_string(),
            profile: profile.clone(),
            access_token: None,
        };
        self.cache.set(&Self::key(&token.access_token), &entry).await?;
        if let Some(refresh_token) = &token.refresh_token {
            // The refresh entry remembers its access token so a later
            // refresh can retire it
            let refresh_entry = ProfileEntry {
                access_token: Some(token.access_token.clone()),
                ..entry
            };
            self.cache.set(&Self::key(refresh_token), &refresh_entry).await?;
        }
        Ok(())
    }

    /// Look up the profile bound to a code or token
    pub async fn retrieve(&self, token_or_code: &str) -> Result<Option<ProfileEntry>, CacheError> {
        self.cache.get(&Self::key(token_or_code)).await
    }

    /// Best-effort removal; used when a code is exchanged and when a
    /// passthrough refresh replaces an access token
    pub async fn delete(&self, token_or_code: &str) {
        if let Err(e) = self.cache.delete(&Self::key(token_or_code)).await {
            warn!("Failed to delete profile store entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryCache;
    use std::collections::HashMap;

    fn store() -> ProfileStore {
        let cache = Cache::InMemory(InMemoryCache::new(60, 16).unwrap());
        ProfileStore::new(Arc::new(cache))
    }

    fn profile(sub: &str) -> OidcProfile {
        OidcProfile {
            sub: sub.to_string(),
            email: Some(format!("{sub}@ex")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_code_roundtrip() {
        let store = store();
        store
            .register_token_or_code("C123", "api1", &profile("u1"))
            .await
            .unwrap();

        let entry = store.retrieve("C123").await.unwrap().unwrap();
        assert_eq!(entry.api_id, "api1");
        assert_eq!(entry.profile.sub, "u1");

        store.delete("C123").await;
        assert!(store.retrieve("C123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_registers_access_and_refresh() {
        let store = store();
        let token = GatewayTokenResponse {
            access_token: "AT".to_string(),
            token_type: "bearer".to_string(),
            expires_in: Some(3600),
            refresh_token: Some("RT".to_string()),
            scope: None,
            extra: HashMap::new(),
        };
        store
            .register_token(&token, "api1", &profile("u1"))
            .await
            .unwrap();

        let by_access = store.retrieve("AT").await.unwrap().unwrap();
        let by_refresh = store.retrieve("RT").await.unwrap().unwrap();
        assert_eq!(by_access.profile, by_refresh.profile);
        assert_eq!(by_refresh.access_token.as_deref(), Some("AT"));
    }

    #[tokio::test]
    async fn test_missing_entry_is_none() {
        let store = store();
        assert!(store.retrieve("nope").await.unwrap().is_none());
    }
}
