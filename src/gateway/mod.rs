//! Typed client over the upstream gateway: the OAuth2 plugin's authorize
//! and token endpoints, plus the admin API for per-API plugin
//! configuration. The gateway mints all codes and tokens; this server only
//! proves, via the provision key, that it is the trusted authorizer.

use http::StatusCode;
use log::{debug, error, warn};
use moka::future::Cache as MokaCache;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod models;

use models::{
    ApiGatewayConfig, AuthorizeParams, AuthorizeResponse, GatewayApiDescriptor, GatewayErrorBody,
    GatewayTokenResponse, OAuth2PluginConfig, PluginList, ResponseType, TokenParams,
};

/// Errors that can occur during gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The gateway rejected an OAuth2 call; error and description are
    /// taken from its response body, the status is preserved
    #[error("Gateway rejected the request ({status}): {error}: {description}")]
    OAuth {
        status: StatusCode,
        error: String,
        description: String,
    },
    /// The API's gateway configuration is unusable (missing provision key
    /// or routing URIs)
    #[error("Gateway configuration error for API {api_id}: {detail}")]
    Config { api_id: String, detail: String },
    /// The requested grant is not enabled on the API's OAuth2 plugin
    #[error("Grant type {0} is not enabled for this API")]
    GrantDisabled(&'static str),
}

/// Gateway client with a process-lifetime configuration cache per API id
#[derive(Clone)]
pub struct GatewayClient {
    admin_client: Client,
    proxy_client: Client,
    admin_url: String,
    api_url: String,
    https_proxy: bool,
    configs: MokaCache<String, Arc<ApiGatewayConfig>>,
}

impl GatewayClient {
    /// Create a new gateway client. When the proxy URL is https the client
    /// accepts self-signed certificates (local gateway deployments
    /// terminate TLS with their own certificate); when it is http the
    /// OAuth2 calls carry `X-Forwarded-Proto: https`.
    pub fn new(
        admin_url: String,
        api_url: String,
        admin_client: Client,
        timeout_secs: u64,
    ) -> Result<Self, String> {
        let admin_url = admin_url.trim_end_matches('/').to_string();
        let api_url = api_url.trim_end_matches('/').to_string();
        let https_proxy = api_url.starts_with("https://");

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(5));
        if https_proxy {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let proxy_client = builder
            .build()
            .map_err(|e| format!("Failed to create gateway HTTP client: {e}"))?;

        Ok(Self {
            admin_client,
            proxy_client,
            admin_url,
            api_url,
            https_proxy,
            configs: MokaCache::builder().build(),
        })
    }

    /// Resolved gateway configuration of an API. Read-through; entries are
    /// kept for the process lifetime. A concurrent first-time fill may
    /// fetch twice, which is harmless.
    pub async fn api_config(&self, api_id: &str) -> Result<Arc<ApiGatewayConfig>, GatewayError> {
        if let Some(config) = self.configs.get(api_id).await {
            return Ok(config);
        }

        let config = Arc::new(self.fetch_api_config(api_id).await?);
        self.configs
            .insert(api_id.to_string(), config.clone())
            .await;
        Ok(config)
    }

    async fn fetch_api_config(&self, api_id: &str) -> Result<ApiGatewayConfig, GatewayError> {
        let plugins_url = format!("{}/apis/{}/plugins?name=oauth2", self.admin_url, api_id);
        debug!("GET {plugins_url}");
        let response = self.admin_client.get(&plugins_url).send().await?;
        if !response.status().is_success() {
            return Err(Self::config_error(api_id, response).await);
        }
        let plugins: PluginList = response.json().await?;
        let plugin_config = plugins
            .data
            .into_iter()
            .find(|p| p.name == "oauth2")
            .map(|p| serde_json::from_value::<OAuth2PluginConfig>(p.config))
            .transpose()
            .map_err(|e| GatewayError::Config {
                api_id: api_id.to_string(),
                detail: format!("cannot parse oauth2 plugin config: {e}"),
            })?
            .ok_or_else(|| GatewayError::Config {
                api_id: api_id.to_string(),
                detail: "API has no oauth2 plugin".to_string(),
            })?;

        let provision_key = plugin_config.provision_key.ok_or_else(|| {
            GatewayError::Config {
                api_id: api_id.to_string(),
                detail: "oauth2 plugin has no provision_key".to_string(),
            }
        })?;

        let api_url = format!("{}/apis/{}", self.admin_url, api_id);
        debug!("GET {api_url}");
        let response = self.admin_client.get(&api_url).send().await?;
        if !response.status().is_success() {
            return Err(Self::config_error(api_id, response).await);
        }
        let descriptor: GatewayApiDescriptor = response.json().await?;
        let uri = descriptor
            .uris
            .first()
            .cloned()
            .ok_or_else(|| GatewayError::Config {
                api_id: api_id.to_string(),
                detail: "API descriptor has no uris".to_string(),
            })?;

        Ok(ApiGatewayConfig {
            provision_key,
            uri,
            enable_authorization_code: plugin_config.enable_authorization_code,
            enable_implicit_grant: plugin_config.enable_implicit_grant,
            enable_client_credentials: plugin_config.enable_client_credentials,
            enable_password_grant: plugin_config.enable_password_grant,
        })
    }

    async fn config_error(api_id: &str, response: reqwest::Response) -> GatewayError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        error!("Gateway admin API error {status} for API {api_id}: {text}");
        GatewayError::Config {
            api_id: api_id.to_string(),
            detail: format!("admin API returned {status}"),
        }
    }

    fn oauth2_url(&self, config: &ApiGatewayConfig, op: &str) -> String {
        format!(
            "{}/{}/oauth2/{}",
            self.api_url,
            config.uri.trim_matches('/'),
            op
        )
    }

    /// Ask the gateway to authorize: returns the redirect URI carrying the
    /// authorization code or access token
    pub async fn authorize(
        &self,
        api_id: &str,
        params: &AuthorizeParams,
    ) -> Result<AuthorizeResponse, GatewayError> {
        let config = self.api_config(api_id).await?;
        match params.response_type {
            ResponseType::Code if !config.enable_authorization_code => {
                return Err(GatewayError::GrantDisabled("authorization_code"));
            }
            ResponseType::Token if !config.enable_implicit_grant => {
                return Err(GatewayError::GrantDisabled("implicit"));
            }
            _ => {}
        }

        let mut body = serde_json::json!({
            "response_type": params.response_type.as_str(),
            "provision_key": config.provision_key,
            "client_id": params.client_id,
            "redirect_uri": params.redirect_uri,
            "authenticated_userid": params.authenticated_userid,
        });
        // The scope field is left out entirely when no scope is requested
        if !params.scope.is_empty() {
            body["scope"] = serde_json::Value::String(params.scope.join(" "));
        }

        let url = self.oauth2_url(&config, "authorize");
        debug!(
            "POST {url} (response_type {}, user {})",
            params.response_type.as_str(),
            params.authenticated_userid
        );
        let response = self.send_oauth2(&url, &body).await?;
        Ok(response.json().await?)
    }

    /// Ask the gateway for a token; the body shape depends on the grant
    pub async fn token(
        &self,
        api_id: &str,
        params: &TokenParams,
    ) -> Result<GatewayTokenResponse, GatewayError> {
        let config = self.api_config(api_id).await?;

        let mut body = serde_json::json!({
            "grant_type": params.grant_type(),
        });
        match params {
            TokenParams::ClientCredentials {
                client_id,
                client_secret,
                scope,
            } => {
                if !config.enable_client_credentials {
                    return Err(GatewayError::GrantDisabled("client_credentials"));
                }
                body["client_id"] = client_id.clone().into();
                body["client_secret"] = client_secret.clone().into();
                if !scope.is_empty() {
                    body["scope"] = scope.join(" ").into();
                }
            }
            TokenParams::AuthorizationCode {
                client_id,
                client_secret,
                code,
                redirect_uri,
            } => {
                if !config.enable_authorization_code {
                    return Err(GatewayError::GrantDisabled("authorization_code"));
                }
                body["client_id"] = client_id.clone().into();
                body["client_secret"] = client_secret.clone().into();
                body["code"] = code.clone().into();
                body["redirect_uri"] = redirect_uri.clone().into();
            }
            TokenParams::Password {
                client_id,
                client_secret,
                authenticated_userid,
                scope,
            } => {
                if !config.enable_password_grant {
                    return Err(GatewayError::GrantDisabled("password"));
                }
                body["client_id"] = client_id.clone().into();
                if let Some(secret) = client_secret {
                    body["client_secret"] = secret.clone().into();
                }
                body["provision_key"] = config.provision_key.clone().into();
                body["authenticated_userid"] = authenticated_userid.clone().into();
                if !scope.is_empty() {
                    body["scope"] = scope.join(" ").into();
                }
            }
            TokenParams::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
            } => {
                body["client_id"] = client_id.clone().into();
                if let Some(secret) = client_secret {
                    body["client_secret"] = secret.clone().into();
                }
                body["refresh_token"] = refresh_token.clone().into();
            }
        }

        let url = self.oauth2_url(&config, "token");
        debug!("POST {url} (grant_type {})", params.grant_type());
        let response = self.send_oauth2(&url, &body).await?;
        Ok(response.json().await?)
    }

    async fn send_oauth2(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut request = self.proxy_client.post(url).json(body);
        if !self.https_proxy {
            // The gateway requires the original schema; local http
            // deployments still speak https to the outside
            request = request.header("X-Forwarded-Proto", "https");
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() > 299 {
            let error_body: GatewayErrorBody = response.json().await.unwrap_or_default();
            warn!(
                "Gateway OAuth2 call failed ({status}): {:?} {:?}",
                error_body.error, error_body.error_description
            );
            return Err(GatewayError::OAuth {
                status,
                error: error_body
                    .error
                    .unwrap_or_else(|| "server_error".to_string()),
                description: error_body
                    .error_description
                    .unwrap_or_else(|| "Gateway request failed".to_string()),
            });
        }
        Ok(response)
    }
}
