//! Typed client over the portal API: subscriptions, users, applications,
//! APIs, registrations, pools, grants and verifications. The portal is the
//! source of truth for all durable state; this server never stores any of
//! these resources itself.

use http::StatusCode;
use log::{debug, error, warn};
use moka::future::Cache as MokaCache;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub mod models;

use models::{
    ApiGrant, ApiInfo, Application, GrantCollection, NewUser, Pool, PoolNamespace, PortalUser,
    Registration, RegistrationCollection, SubscriptionInfo, UserPatch, Verification,
};

/// Errors that can occur during portal API operations
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("A user with this email address already exists")]
    DuplicateEmail,
    #[error("Portal API error {0}: {1}")]
    Api(StatusCode, String),
}

impl PortalError {
    /// The upstream status code, when the portal answered at all
    pub fn upstream_status(&self) -> Option<StatusCode> {
        match self {
            Self::Api(status, _) => Some(*status),
            Self::NotFound(_) => Some(StatusCode::NOT_FOUND),
            _ => None,
        }
    }
}

/// Portal API client
#[derive(Clone, Debug)]
pub struct PortalClient {
    client: Client,
    base_url: String,
    /// Read-through per-API descriptor cache, effectively immutable for
    /// the process lifetime
    api_cache: MokaCache<String, Arc<ApiInfo>>,
}

impl PortalClient {
    /// Create a new portal client for the given base URL
    pub fn new(base_url: String, client: Client) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            api_cache: MokaCache::builder().build(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_error(response: reqwest::Response) -> PortalError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        error!("Portal API error {status}: {text}");
        PortalError::Api(status, text)
    }

    /// GET a resource; 404 becomes `None`
    async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, PortalError> {
        let url = self.url(path);
        debug!("GET {url}");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(Some(response.json().await?))
    }

    /// GET a resource that must exist
    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T, PortalError> {
        self.get_opt(path)
            .await?
            .ok_or_else(|| PortalError::NotFound(path.to_string()))
    }

    // --- Subscriptions ---

    /// Look up a subscription (plus its owning application) by client id
    pub async fn get_subscription(&self, client_id: &str) -> Result<SubscriptionInfo, PortalError> {
        self.get_required(&format!("/subscriptions/{client_id}"))
            .await
    }

    // --- Users ---

    pub async fn get_user(&self, user_id: &str) -> Result<PortalUser, PortalError> {
        self.get_required(&format!("/users/{user_id}")).await
    }

    pub async fn get_user_opt(&self, user_id: &str) -> Result<Option<PortalUser>, PortalError> {
        self.get_opt(&format!("/users/{user_id}")).await
    }

    /// Users matching an email address; the portal returns short records
    pub async fn find_users_by_email(&self, email: &str) -> Result<Vec<PortalUser>, PortalError> {
        self.find_users(&[("email", email)]).await
    }

    /// Users matching an IdP-assigned custom id
    pub async fn find_users_by_custom_id(
        &self,
        custom_id: &str,
    ) -> Result<Vec<PortalUser>, PortalError> {
        self.find_users(&[("customId", custom_id)]).await
    }

    async fn find_users(&self, query: &[(&str, &str)]) -> Result<Vec<PortalUser>, PortalError> {
        let url = self.url("/users");
        debug!("GET {url} {query:?}");
        let response = self.client.get(&url).query(query).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Create a portal user; a duplicate email surfaces as a specific error
    pub async fn create_user(&self, new_user: &NewUser) -> Result<PortalUser, PortalError> {
        let url = self.url("/users");
        debug!("POST {url} (email {})", new_user.email);
        let response = self.client.post(&url).json(new_user).send().await?;
        if response.status() == StatusCode::CONFLICT {
            warn!("User creation conflict for email {}", new_user.email);
            return Err(PortalError::DuplicateEmail);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn patch_user(
        &self,
        user_id: &str,
        patch: &UserPatch,
    ) -> Result<PortalUser, PortalError> {
        let url = self.url(&format!("/users/{user_id}"));
        debug!("PATCH {url}");
        let response = self.client.patch(&url).json(patch).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Verify local credentials. The portal owns user storage, so password
    /// checks happen there.
    pub async fn login(&self, username: &str, password: &str) -> Result<PortalUser, PortalError> {
        let url = self.url("/login");
        debug!("POST {url} (user {username})");
        let body = serde_json::json!({ "username": username, "password": password });
        let response = self.client.post(&url).json(&body).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(PortalError::InvalidCredentials)
            }
            _ => Err(Self::read_error(response).await),
        }
    }

    // --- APIs and applications ---

    pub async fn get_api(&self, api_id: &str) -> Result<ApiInfo, PortalError> {
        self.get_required(&format!("/apis/{api_id}")).await
    }

    /// Cached API descriptor; concurrent first-time fills may fetch twice,
    /// which is harmless since the descriptor is immutable per process
    pub async fn get_api_cached(&self, api_id: &str) -> Result<Arc<ApiInfo>, PortalError> {
        if let Some(api) = self.api_cache.get(api_id).await {
            return Ok(api);
        }
        let api = Arc::new(self.get_api(api_id).await?);
        self.api_cache.insert(api_id.to_string(), api.clone()).await;
        Ok(api)
    }

    /// Application record, for display purposes; `None` when unknown
    pub async fn get_application(
        &self,
        application_id: &str,
    ) -> Result<Option<Application>, PortalError> {
        self.get_opt(&format!("/applications/{application_id}"))
            .await
    }

    // --- Registrations and pools ---

    /// All registrations of a user in a pool (one per namespace)
    pub async fn get_registrations(
        &self,
        pool_id: &str,
        user_id: &str,
    ) -> Result<Vec<Registration>, PortalError> {
        let collection: Option<RegistrationCollection> = self
            .get_opt(&format!("/registrations/pools/{pool_id}/users/{user_id}"))
            .await?;
        Ok(collection.map(|c| c.items).unwrap_or_default())
    }

    /// Create or replace a registration; idempotent per (pool, user,
    /// namespace)
    pub async fn upsert_registration(
        &self,
        pool_id: &str,
        user_id: &str,
        registration: &Registration,
    ) -> Result<(), PortalError> {
        let url = self.url(&format!("/registrations/pools/{pool_id}/users/{user_id}"));
        debug!("PUT {url}");
        let response = self.client.put(&url).json(registration).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<Pool, PortalError> {
        self.get_required(&format!("/pools/{pool_id}")).await
    }

    pub async fn get_pool_namespace(
        &self,
        pool_id: &str,
        namespace: &str,
    ) -> Result<Option<PoolNamespace>, PortalError> {
        self.get_opt(&format!("/pools/{pool_id}/namespaces/{namespace}"))
            .await
    }

    // --- Scope grants ---

    /// All grants of a user, across applications and APIs
    pub async fn get_grants(&self, user_id: &str) -> Result<Vec<ApiGrant>, PortalError> {
        let collection: Option<GrantCollection> =
            self.get_opt(&format!("/grants/{user_id}")).await?;
        Ok(collection.map(|c| c.items).unwrap_or_default())
    }

    pub async fn get_grant(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
    ) -> Result<Option<ApiGrant>, PortalError> {
        self.get_opt(&format!(
            "/grants/{user_id}/applications/{application_id}/apis/{api_id}"
        ))
        .await
    }

    /// Create or replace the grant for one (user, application, API) triple
    pub async fn put_grant(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
        grant: &ApiGrant,
    ) -> Result<(), PortalError> {
        let url = self.url(&format!(
            "/grants/{user_id}/applications/{application_id}/apis/{api_id}"
        ));
        debug!("PUT {url}");
        let response = self.client.put(&url).json(grant).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }

    pub async fn delete_grant(
        &self,
        user_id: &str,
        application_id: &str,
        api_id: &str,
    ) -> Result<(), PortalError> {
        let url = self.url(&format!(
            "/grants/{user_id}/applications/{application_id}/apis/{api_id}"
        ));
        debug!("DELETE {url}");
        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }

    // --- Verifications ---

    pub async fn create_verification(
        &self,
        verification: &Verification,
    ) -> Result<(), PortalError> {
        let url = self.url("/verifications");
        debug!("POST {url} ({:?})", verification.kind);
        let response = self.client.post(&url).json(verification).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }

    pub async fn get_verification(
        &self,
        verification_id: &str,
    ) -> Result<Option<Verification>, PortalError> {
        self.get_opt(&format!("/verifications/{verification_id}"))
            .await
    }

    /// Best-effort delete of a used verification
    pub async fn delete_verification(&self, verification_id: &str) -> Result<(), PortalError> {
        let url = self.url(&format!("/verifications/{verification_id}"));
        debug!("DELETE {url}");
        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Self::read_error(response).await);
        }
        Ok(())
    }

    /// Helper for POSTing arbitrary JSON to an absolute URL, used by the
    /// passthrough scope call which targets an externally configured service
    pub async fn post_external<B: Serialize, T: DeserializeOwned>(
        client: &Client,
        url: &str,
        body: &B,
    ) -> Result<T, PortalError> {
        debug!("POST {url} (external)");
        let response = client.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(mock: &MockServer) -> PortalClient {
        PortalClient::new(mock.uri(), Client::new())
    }

    #[tokio::test]
    async fn test_get_subscription() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/CID"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subscription": {
                    "api": "api1", "application": "app1",
                    "clientId": "CID", "trusted": true
                },
                "application": { "id": "app1", "confidential": false }
            })))
            .mount(&mock)
            .await;

        let info = client_for(&mock).get_subscription("CID").await.unwrap();
        assert!(info.subscription.trusted);
        assert_eq!(info.application.id, "app1");
    }

    #[tokio::test]
    async fn test_get_subscription_not_found() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/unknown"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock)
            .await;

        let err = client_for(&mock)
            .get_subscription("unknown")
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_find_users_by_custom_id() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .and(query_param("customId", "github:42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": "u1", "email": "u1@ex" }
            ])))
            .mount(&mock)
            .await;

        let users = client_for(&mock)
            .find_users_by_custom_id("github:42")
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "u1");
    }

    #[tokio::test]
    async fn test_create_user_duplicate_email() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&mock)
            .await;

        let err = client_for(&mock)
            .create_user(&NewUser {
                email: "u1@ex".to_string(),
                custom_id: None,
                validated: true,
                password: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::DuplicateEmail));
        assert_eq!(
            err.to_string(),
            "A user with this email address already exists"
        );
    }

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;

        let err = client_for(&mock).login("u1@ex", "nope").await.unwrap_err();
        assert!(matches!(err, PortalError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_registrations_missing_pool_is_empty() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registrations/pools/p/users/u1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock)
            .await;

        let regs = client_for(&mock).get_registrations("p", "u1").await.unwrap();
        assert!(regs.is_empty());
    }

    #[tokio::test]
    async fn test_delete_grant_tolerates_missing() {
        let mock = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/grants/u1/applications/app1/apis/api1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock)
            .await;

        client_for(&mock)
            .delete_grant("u1", "app1", "api1")
            .await
            .unwrap();
    }
}
