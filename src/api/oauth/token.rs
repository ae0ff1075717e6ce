//! The token endpoint. Always answers JSON. Client credentials and
//! authorization code exchanges delegate straight to the gateway; the
//! password and refresh grants carry the flow specializations around
//! user reconciliation, registration namespaces and passthrough scope
//! resolution.

use super::error::{ErrorRender, FlowError, OAuthErrorKind};
use super::flow::{
    build_authenticated_userid, merge_group_scopes, reconcile_user_response,
    resolve_passthrough_scope, strip_group_scopes,
};
#[allow(unused_imports)]
use super::models::{OAuthErrorBody, TokenResponse};
use super::models::{TokenRequestBody, TokenRequestExtractor};
use crate::gateway::models::{GatewayTokenResponse, TokenParams};
use crate::idp::IdpError;
use crate::openapi::OAUTH2_TAG;
use crate::portal::models::{ApiInfo, SubscriptionInfo};
use crate::portal::PortalError;
use crate::session::OidcProfile;
use crate::state::MethodState;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{info, warn};
use std::sync::Arc;

/// POST /api/:apiId/token
#[utoipa::path(
    post,
    path = "/api/{api_id}/token",
    request_body = TokenRequestBody,
    responses(
        (status = 200, description = "Access token issued", body = TokenResponse),
        (status = 400, description = "Invalid request", body = OAuthErrorBody),
        (status = 401, description = "Invalid client credentials", body = OAuthErrorBody),
        (status = 403, description = "Not allowed", body = OAuthErrorBody),
        (status = 500, description = "Server error", body = OAuthErrorBody)
    ),
    tag = OAUTH2_TAG
)]
pub async fn token_post(
    State(state): State<MethodState>,
    Path(api_id): Path<String>,
    TokenRequestExtractor(body): TokenRequestExtractor,
) -> Response {
    super::error::respond(token_inner(&state, &api_id, body).await).await
}

async fn token_inner(
    state: &MethodState,
    api_id: &str,
    body: TokenRequestBody,
) -> Result<Response, FlowError> {
    info!(
        "Token request for API {api_id} with grant_type {}",
        body.grant_type
    );
    match body.grant_type.as_str() {
        "client_credentials" => client_credentials_grant(state, api_id, body).await,
        "authorization_code" => authorization_code_grant(state, api_id, body).await,
        "password" => password_grant(state, api_id, body).await,
        "refresh_token" => refresh_grant(state, api_id, body).await,
        other => Err(FlowError::json(
            OAuthErrorKind::UnsupportedGrantType,
            format!("Grant type {other} is not supported"),
        )),
    }
}

/// Look up and sanity-check the subscription behind a client id
async fn validated_subscription(
    state: &MethodState,
    api_id: &str,
    body: &TokenRequestBody,
) -> Result<SubscriptionInfo, FlowError> {
    let client_id = body
        .client_id
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            FlowError::json(OAuthErrorKind::InvalidRequest, "client_id is required")
        })?;
    let info = state
        .app
        .portal
        .get_subscription(client_id)
        .await
        .map_err(|e| match e {
            PortalError::NotFound(_) => FlowError::json(
                OAuthErrorKind::InvalidClient,
                format!("Unknown client id {client_id}"),
            )
            .delayed(),
            other => FlowError::from_portal(other, ErrorRender::Json),
        })?;
    if info.subscription.api != api_id {
        return Err(FlowError::json(
            OAuthErrorKind::InvalidRequest,
            format!("The client is not subscribed to API {api_id}"),
        ));
    }
    Ok(info)
}

/// Client secret rules: confidential applications must present the
/// stored secret; public ones may present it (then it must match), or,
/// for the password grant, must not present one at all
fn check_client_secret(
    info: &SubscriptionInfo,
    presented: Option<&str>,
    forbid_for_public: bool,
) -> Result<(), FlowError> {
    let presented = presented.filter(|s| !s.is_empty());
    let stored = info.subscription.client_secret.as_deref();
    if info.application.confidential {
        match (presented, stored) {
            (Some(presented), Some(stored)) if presented == stored => Ok(()),
            _ => Err(FlowError::json(
                OAuthErrorKind::InvalidClient,
                "client_secret is missing or does not match",
            )
            .delayed()),
        }
    } else if forbid_for_public {
        match presented {
            Some(_) => Err(FlowError::json(
                OAuthErrorKind::InvalidRequest,
                "Public applications must not present a client_secret",
            )),
            None => Ok(()),
        }
    } else {
        match presented {
            Some(presented) if stored != Some(presented) => Err(FlowError::json(
                OAuthErrorKind::InvalidClient,
                "client_secret does not match",
            )
            .delayed()),
            _ => Ok(()),
        }
    }
}

fn stored_secret(info: &SubscriptionInfo) -> Result<String, FlowError> {
    info.subscription.client_secret.clone().ok_or_else(|| {
        FlowError::json(
            OAuthErrorKind::ServerError,
            "The subscription carries no client secret",
        )
    })
}

/// Scope validation mirrors the authorize endpoint: untrusted
/// subscriptions are bound to the API's catalogue, trusted ones receive
/// the full catalogue
fn validate_scope(
    api: &ApiInfo,
    trusted: bool,
    requested: Vec<String>,
) -> Result<Vec<String>, FlowError> {
    if trusted {
        return Ok(api.scope_names());
    }
    let catalogue = api.scope_names();
    for scope_name in &requested {
        if !catalogue.contains(scope_name) {
            return Err(FlowError::json(
                OAuthErrorKind::InvalidScope,
                format!("Scope {scope_name} is not known for API {}", api.id),
            ));
        }
    }
    Ok(requested)
}

async fn api_descriptor(state: &MethodState, api_id: &str) -> Result<Arc<ApiInfo>, FlowError> {
    state
        .app
        .portal
        .get_api_cached(api_id)
        .await
        .map_err(|e| match e {
            PortalError::NotFound(_) => {
                FlowError::json(OAuthErrorKind::InvalidRequest, format!("Unknown API {api_id}"))
            }
            other => FlowError::from_portal(other, ErrorRender::Json),
        })
}

async fn client_credentials_grant(
    state: &MethodState,
    api_id: &str,
    body: TokenRequestBody,
) -> Result<Response, FlowError> {
    let info = validated_subscription(state, api_id, &body).await?;
    // Client credentials authenticate the application itself, so the
    // secret is always required
    let presented = body.client_secret.as_deref().filter(|s| !s.is_empty());
    let stored = stored_secret(&info)?;
    if presented != Some(stored.as_str()) {
        return Err(FlowError::json(
            OAuthErrorKind::InvalidClient,
            "client_secret is missing or does not match",
        )
        .delayed());
    }

    let api = api_descriptor(state, api_id).await?;
    let scope = validate_scope(&api, info.subscription.trusted, body.scope_list())?;

    let token = state
        .app
        .gateway
        .token(
            api_id,
            &TokenParams::ClientCredentials {
                client_id: info.subscription.client_id.clone(),
                client_secret: stored,
                scope,
            },
        )
        .await
        .map_err(|e| FlowError::from_gateway(e, ErrorRender::Json))?;
    Ok(Json(token).into_response())
}

async fn authorization_code_grant(
    state: &MethodState,
    api_id: &str,
    body: TokenRequestBody,
) -> Result<Response, FlowError> {
    let info = validated_subscription(state, api_id, &body).await?;
    check_client_secret(&info, body.client_secret.as_deref(), false)?;

    let code = body.code.as_deref().filter(|c| !c.is_empty()).ok_or_else(|| {
        FlowError::json(
            OAuthErrorKind::InvalidRequest,
            "code is required for the authorization_code grant",
        )
    })?;
    let redirect_uri = body
        .redirect_uri
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            FlowError::json(
                OAuthErrorKind::InvalidRequest,
                "redirect_uri is required for the authorization_code grant",
            )
        })?;

    let secret = stored_secret(&info)?;
    let token = state
        .app
        .gateway
        .token(
            api_id,
            &TokenParams::AuthorizationCode {
                client_id: info.subscription.client_id.clone(),
                client_secret: secret,
                code: code.to_string(),
                redirect_uri: redirect_uri.to_string(),
            },
        )
        .await
        .map_err(|e| FlowError::from_gateway(e, ErrorRender::Json))?;

    // Rebind the profile from the consumed code to the issued tokens;
    // the code entry is gone afterwards
    match state.app.profiles.retrieve(code).await {
        Ok(Some(entry)) => {
            state
                .app
                .profiles
                .register_token(&token, api_id, &entry.profile)
                .await
                .map_err(|e| FlowError::json(OAuthErrorKind::ServerError, e))?;
            state.app.profiles.delete(code).await;
        }
        Ok(None) => {
            warn!("No profile entry for exchanged code; /profile will not resolve this token");
        }
        Err(e) => {
            return Err(FlowError::json(OAuthErrorKind::ServerError, e));
        }
    }

    Ok(Json(token).into_response())
}

async fn password_grant(
    state: &MethodState,
    api_id: &str,
    body: TokenRequestBody,
) -> Result<Response, FlowError> {
    let info = validated_subscription(state, api_id, &body).await?;
    // Only trusted subscriptions may exercise the password grant
    if !info.subscription.trusted {
        return Err(FlowError::json(
            OAuthErrorKind::InvalidRequest,
            "The password grant requires a trusted subscription",
        ));
    }
    check_client_secret(&info, body.client_secret.as_deref(), true)?;

    let username = body
        .username
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            FlowError::json(OAuthErrorKind::InvalidRequest, "username is required")
        })?;
    let password = body.password.as_deref().unwrap_or_default();

    let api = api_descriptor(state, api_id).await?;

    let mut auth_response = match state.idp.authorize_by_user_pass(username, password).await {
        Ok(response) => response,
        Err(IdpError::InvalidCredentials) => {
            return Err(FlowError::json(
                OAuthErrorKind::AccessDenied,
                "Invalid username or password",
            )
            .delayed());
        }
        Err(e) => {
            return Err(FlowError::json(
                OAuthErrorKind::ServerError,
                format!("Identity provider failed: {e}"),
            ));
        }
    };

    reconcile_user_response(&state.app.portal, api.passthrough_users, &mut auth_response)
        .await
        .map_err(|(kind, message)| FlowError::json(kind, message))?;

    let scope = validate_scope(&api, true, body.scope_list())?;

    // Build the effective profile and the authenticated user id,
    // including the namespaces list for namespace-requiring pools
    let mut profile = auth_response.default_profile.clone();
    let authenticated_userid = if api.passthrough_users {
        profile.sub.clone()
    } else {
        let user_id = auth_response.user_id.clone().ok_or_else(|| {
            FlowError::json(OAuthErrorKind::ServerError, "No portal user after login")
        })?;
        profile.sub = user_id.clone();
        match &api.registration_pool {
            Some(pool_id) => {
                let pool = state
                    .app
                    .portal
                    .get_pool(pool_id)
                    .await
                    .map_err(|e| FlowError::from_portal(e, ErrorRender::Json))?;
                if pool.requires_namespace {
                    let registrations = state
                        .app
                        .portal
                        .get_registrations(pool_id, &user_id)
                        .await
                        .map_err(|e| FlowError::from_portal(e, ErrorRender::Json))?;
                    let namespaces: Vec<String> = registrations
                        .iter()
                        .filter_map(|r| r.namespace.clone())
                        .collect();
                    if namespaces.is_empty() {
                        return Err(FlowError::json(
                            OAuthErrorKind::InvalidRequest,
                            format!("The user is not registered in pool {pool_id}"),
                        ));
                    }
                    format!("sub={user_id};namespaces={}", namespaces.join(","))
                } else {
                    build_authenticated_userid(false, Some(&user_id), &profile, None)
                }
            }
            None => build_authenticated_userid(false, Some(&user_id), &profile, None),
        }
    };

    let merged_scope =
        merge_group_scopes(&scope, auth_response.groups.as_deref().unwrap_or_default());

    let token = state
        .app
        .gateway
        .token(
            api_id,
            &TokenParams::Password {
                client_id: info.subscription.client_id.clone(),
                client_secret: info.subscription.client_secret.clone(),
                authenticated_userid: authenticated_userid.clone(),
                scope: merged_scope,
            },
        )
        .await
        .map_err(|e| FlowError::from_gateway(e, ErrorRender::Json))?;

    register_issued_token(state, api_id, &token, &profile).await?;
    info!("Password grant succeeded for {authenticated_userid} on API {api_id}");
    Ok(Json(token).into_response())
}

async fn refresh_grant(
    state: &MethodState,
    api_id: &str,
    body: TokenRequestBody,
) -> Result<Response, FlowError> {
    let info = validated_subscription(state, api_id, &body).await?;
    check_client_secret(&info, body.client_secret.as_deref(), false)?;

    let refresh_token = body
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            FlowError::json(OAuthErrorKind::InvalidRequest, "refresh_token is required")
        })?;

    let api = api_descriptor(state, api_id).await?;
    match (api.passthrough_users, api.passthrough_scope_url.clone()) {
        (false, None) => refresh_portal_user(state, api_id, &info, refresh_token).await,
        (true, None) => Err(FlowError::json(
            OAuthErrorKind::ServerError,
            "Refresh is not supported for passthrough APIs without a scope resolver",
        )),
        (false, Some(_)) => Err(FlowError::json(
            OAuthErrorKind::ServerError,
            "Refresh is not supported for portal-managed users with a scope resolver",
        )),
        (true, Some(scope_url)) => {
            refresh_passthrough(state, api_id, &info, refresh_token, &scope_url, &body).await
        }
    }
}

/// Refresh mode for portal-managed users: the IdP and the portal both
/// have to still know the user
async fn refresh_portal_user(
    state: &MethodState,
    api_id: &str,
    info: &SubscriptionInfo,
    refresh_token: &str,
) -> Result<Response, FlowError> {
    let entry = state
        .app
        .profiles
        .retrieve(refresh_token)
        .await
        .map_err(|e| FlowError::json(OAuthErrorKind::ServerError, e))?
        .ok_or_else(|| {
            FlowError::json(
                OAuthErrorKind::InvalidRequest,
                "The refresh token is not known",
            )
        })?;

    let decision = state
        .idp
        .check_refresh_token(&entry.profile)
        .await
        .map_err(|e| {
            FlowError::json(
                OAuthErrorKind::ServerError,
                format!("Identity provider failed: {e}"),
            )
        })?;
    if !decision.allow {
        return Err(FlowError::json(
            OAuthErrorKind::AccessDenied,
            "The identity provider rejected the refresh",
        ));
    }

    let user_id = entry.profile.sub.clone();
    let user = state
        .app
        .portal
        .get_user_opt(&user_id)
        .await
        .map_err(|e| FlowError::from_portal(e, ErrorRender::Json))?;
    if user.is_none() {
        return Err(FlowError::json(
            OAuthErrorKind::InvalidRequest,
            "The user behind the refresh token no longer exists",
        ));
    }

    let token = state
        .app
        .gateway
        .token(
            api_id,
            &TokenParams::RefreshToken {
                client_id: info.subscription.client_id.clone(),
                client_secret: info.subscription.client_secret.clone(),
                refresh_token: refresh_token.to_string(),
            },
        )
        .await
        .map_err(|e| FlowError::from_gateway(e, ErrorRender::Json))?;

    register_issued_token(state, api_id, &token, &entry.profile).await?;
    info!("Refresh succeeded for sub {user_id} on API {api_id}");
    Ok(Json(token).into_response())
}

/// Refresh mode for passthrough APIs with an external scope resolver:
/// scope and user id are re-resolved, the request is rewritten into a
/// password grant, and the superseded access token is retired
async fn refresh_passthrough(
    state: &MethodState,
    api_id: &str,
    info: &SubscriptionInfo,
    refresh_token: &str,
    scope_url: &str,
    body: &TokenRequestBody,
) -> Result<Response, FlowError> {
    let entry = state
        .app
        .profiles
        .retrieve(refresh_token)
        .await
        .map_err(|e| FlowError::json(OAuthErrorKind::ServerError, e))?
        .ok_or_else(|| {
            FlowError::json(
                OAuthErrorKind::InvalidRequest,
                "The refresh token is not known",
            )
        })?;

    // Synthetic group scopes never travel to the resolver
    let scope = strip_group_scopes(&body.scope_list());
    let resolution =
        resolve_passthrough_scope(&state.app.http, scope_url, scope, entry.profile.clone())
            .await
            .map_err(|e| FlowError::json(OAuthErrorKind::ServerError, e))?;
    if !resolution.allow {
        return Err(FlowError::json(
            OAuthErrorKind::AccessDenied,
            resolution
                .error_message
                .unwrap_or_else(|| "Scope was not granted".to_string()),
        ));
    }
    let authenticated_userid = resolution.authenticated_userid.ok_or_else(|| {
        FlowError::json(
            OAuthErrorKind::ServerError,
            "The scope resolver did not supply an authenticated user id",
        )
    })?;

    let mut profile = entry.profile.clone();
    profile.sub = authenticated_userid.clone();

    let token = state
        .app
        .gateway
        .token(
            api_id,
            &TokenParams::Password {
                client_id: info.subscription.client_id.clone(),
                client_secret: info.subscription.client_secret.clone(),
                authenticated_userid,
                scope: resolution.authenticated_scope,
            },
        )
        .await
        .map_err(|e| FlowError::from_gateway(e, ErrorRender::Json))?;

    register_issued_token(state, api_id, &token, &profile).await?;
    if let Some(previous_access_token) = &entry.access_token {
        state.app.profiles.delete(previous_access_token).await;
    }
    Ok(Json(token).into_response())
}

/// The binding must exist before the JSON response is written
async fn register_issued_token(
    state: &MethodState,
    api_id: &str,
    token: &GatewayTokenResponse,
    profile: &OidcProfile,
) -> Result<(), FlowError> {
    state
        .app
        .profiles
        .register_token(token, api_id, profile)
        .await
        .map_err(|e| FlowError::json(OAuthErrorKind::ServerError, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::models::{Application, Subscription};

    fn subscription(confidential: bool, secret: Option<&str>) -> SubscriptionInfo {
        SubscriptionInfo {
            subscription: Subscription {
                api: "api1".to_string(),
                application: "app1".to_string(),
                client_id: "CID".to_string(),
                client_secret: secret.map(|s| s.to_string()),
                trusted: false,
            },
            application: Application {
                id: "app1".to_string(),
                name: None,
                confidential,
                redirect_uri: None,
                redirect_uris: vec![],
            },
        }
    }

    #[test]
    fn test_confidential_requires_matching_secret() {
        let info = subscription(true, Some("S"));
        assert!(check_client_secret(&info, Some("S"), false).is_ok());
        let err = check_client_secret(&info, Some("wrong"), false).unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidClient);
        assert!(err.delayed);
        assert!(check_client_secret(&info, None, false).is_err());
    }

    #[test]
    fn test_public_must_not_present_secret_for_password_grant() {
        let info = subscription(false, Some("S"));
        assert!(check_client_secret(&info, None, true).is_ok());
        let err = check_client_secret(&info, Some("S"), true).unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidRequest);
    }

    #[test]
    fn test_public_presented_secret_must_match_elsewhere() {
        let info = subscription(false, Some("S"));
        assert!(check_client_secret(&info, None, false).is_ok());
        assert!(check_client_secret(&info, Some("S"), false).is_ok());
        assert!(check_client_secret(&info, Some("wrong"), false).is_err());
    }

    #[test]
    fn test_validate_scope_trusted_gets_full_catalogue() {
        let api: ApiInfo = serde_json::from_value(serde_json::json!({
            "id": "api1",
            "settings": { "scopes": { "read": {}, "write": {} } }
        }))
        .unwrap();
        let mut scope = validate_scope(&api, true, vec!["read".to_string()]).unwrap();
        scope.sort();
        assert_eq!(scope, vec!["read", "write"]);
    }

    #[test]
    fn test_validate_scope_untrusted_unknown_scope() {
        let api: ApiInfo = serde_json::from_value(serde_json::json!({
            "id": "api1",
            "settings": { "scopes": { "read": {} } }
        }))
        .unwrap();
        let err = validate_scope(
            &api,
            false,
            vec!["read".to_string(), "delete".to_string()],
        )
        .unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidScope);
    }
}
