//! Flow orchestrator: drives an authenticated end user from the IdP's
//! auth response to a gateway-minted code or token. Linear procedural
//! steps with typed results: user reconciliation, registration pool
//! processing, scope consent or passthrough scope resolution, and the
//! gateway mint itself. Every step may instead return an interstitial
//! page (login, registration, namespace selection, consent) that
//! re-enters the flow on its POST.

use super::error::{ErrorRender, FlowError, OAuthErrorKind};
use super::templates;
use crate::gateway::models::AuthorizeParams;
use crate::portal::models::{ApiInfo, NewUser, Registration};
use crate::portal::PortalError;
use crate::session::{
    random_token, AuthRequest, MethodSession, OidcProfile, SessionHandle,
};
use crate::state::MethodState;
use axum::response::{Html, IntoResponse, Redirect, Response};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Prefix of the synthetic scopes carrying portal group membership
pub const GROUP_SCOPE_PREFIX: &str = "wicked:";

/// Request body sent to a passthrough scope resolver
#[derive(Debug, Serialize)]
pub struct PassthroughScopeRequest {
    pub scope: Vec<String>,
    pub profile: OidcProfile,
}

/// Answer of a passthrough scope resolver
#[derive(Debug, Clone, Deserialize)]
pub struct PassthroughScopeResponse {
    pub allow: bool,
    #[serde(default)]
    pub authenticated_scope: Vec<String>,
    #[serde(default)]
    pub authenticated_userid: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// One flow run for a method within a session
pub struct Flow<'a> {
    pub state: &'a MethodState,
    pub session: &'a mut SessionHandle,
}

impl<'a> Flow<'a> {
    pub fn new(state: &'a MethodState, session: &'a mut SessionHandle) -> Self {
        Self { state, session }
    }

    fn method_id(&self) -> &str {
        self.state.method_id()
    }

    /// Base path of this method's router, e.g. `/auth/local`
    pub fn base(&self) -> String {
        method_base(self.state)
    }

    fn slot(&mut self) -> &mut MethodSession {
        let method_id = self.state.method_id().to_string();
        self.session.data.method_mut(&method_id)
    }

    fn auth_request(&self) -> Result<AuthRequest, FlowError> {
        self.session
            .data
            .method(self.state.method_id())
            .and_then(|m| m.auth_request.clone())
            .ok_or_else(|| {
                FlowError::page(
                    OAuthErrorKind::InvalidRequest,
                    "There is no authorization request in progress",
                )
            })
    }

    /// How errors of this flow reach the user agent: back to the client
    /// when a redirect URI is known, an error page otherwise
    pub fn render_mode(&self) -> ErrorRender {
        match self
            .session
            .data
            .method(self.state.method_id())
            .and_then(|m| m.auth_request.as_ref())
        {
            Some(request) if !request.plain && !request.redirect_uri.is_empty() => {
                ErrorRender::Redirect {
                    redirect_uri: request.redirect_uri.clone(),
                    state: request.state.clone(),
                }
            }
            _ => ErrorRender::Page,
        }
    }

    fn fail(&self, kind: OAuthErrorKind, description: impl ToString) -> FlowError {
        FlowError::new(kind, description, self.render_mode())
    }

    fn portal_fail(&self, err: PortalError) -> FlowError {
        FlowError::from_portal(err, self.render_mode())
    }

    async fn api(&self) -> Result<Arc<ApiInfo>, FlowError> {
        let request = self.auth_request()?;
        self.state
            .app
            .portal
            .get_api_cached(&request.api_id)
            .await
            .map_err(|e| self.portal_fail(e))
    }

    /// Drive the flow from an authenticated auth response to completion
    pub async fn continue_authorize(&mut self) -> Result<Response, FlowError> {
        self.reconcile_user().await?;
        if let Some(interstitial) = self.registration_decide().await? {
            return Ok(interstitial);
        }
        self.authorize_decide().await
    }

    /// Resolve or create the portal user behind the auth response.
    /// Passthrough APIs skip the portal entirely.
    async fn reconcile_user(&mut self) -> Result<(), FlowError> {
        let request = self.auth_request()?;
        let passthrough = if request.plain {
            false
        } else {
            self.api().await?.passthrough_users
        };

        let mut response = self
            .slot()
            .auth_response
            .clone()
            .ok_or_else(|| self.fail(OAuthErrorKind::ServerError, "No authenticated user"))?;

        reconcile_user_response(&self.state.app.portal, passthrough, &mut response)
            .await
            .map_err(|(kind, message)| self.fail(kind, message))?;

        self.slot().auth_response = Some(response);
        Ok(())
    }

    /// Decide whether registration processing is needed. Returns an
    /// interstitial response when the user has to interact first.
    async fn registration_decide(&mut self) -> Result<Option<Response>, FlowError> {
        let request = self.auth_request()?;

        if request.plain {
            // Plain login: no gateway, just finish the session and return
            let profile = self.effective_default_profile();
            if let Some(response) = self.slot().auth_response.as_mut() {
                response.profile = Some(profile);
            }
            debug!("Plain login complete, returning to {}", request.redirect_uri);
            return Ok(Some(Redirect::to(&request.redirect_uri).into_response()));
        }

        let api = self.api().await?;
        let pool_id = api.registration_pool.clone().or_else(|| {
            self.session
                .data
                .method(self.state.method_id())
                .and_then(|m| m.auth_response.as_ref())
                .and_then(|r| r.registration_pool.clone())
        });

        match pool_id {
            None => {
                let profile = self.effective_default_profile();
                if let Some(response) = self.slot().auth_response.as_mut() {
                    response.profile = Some(profile);
                }
                Ok(None)
            }
            Some(pool_id) => self.registration_flow(&pool_id).await,
        }
    }

    /// Registration pool processing: pick, select or create the user's
    /// registration in the pool
    async fn registration_flow(&mut self, pool_id: &str) -> Result<Option<Response>, FlowError> {
        let request = self.auth_request()?;
        let user_id = self
            .slot()
            .auth_response
            .as_ref()
            .and_then(|r| r.user_id.clone())
            .ok_or_else(|| {
                self.fail(
                    OAuthErrorKind::ServerError,
                    "Registration pools require a portal user",
                )
            })?;

        let portal = &self.state.app.portal;
        let pool = portal
            .get_pool(pool_id)
            .await
            .map_err(|e| self.portal_fail(e))?;
        let mut registrations = portal
            .get_registrations(pool_id, &user_id)
            .await
            .map_err(|e| self.portal_fail(e))?;

        // A namespace-requiring pool is partitioned elsewhere; a user
        // without any registration in it cannot proceed
        if pool.requires_namespace && registrations.is_empty() {
            return Err(self.fail(
                OAuthErrorKind::InvalidRequest,
                format!("You have no registration in pool {pool_id}"),
            ));
        }

        if let Some(namespace) = &request.namespace {
            let known = portal
                .get_pool_namespace(pool_id, namespace)
                .await
                .map_err(|e| self.portal_fail(e))?;
            if known.is_none() {
                return Err(self.fail(
                    OAuthErrorKind::InvalidRequest,
                    format!("Unknown namespace {namespace}"),
                ));
            }
            registrations.retain(|r| r.namespace.as_deref() == Some(namespace.as_str()));
        }

        match registrations.len() {
            0 => {
                if pool.disable_register {
                    return Err(self.fail(
                        OAuthErrorKind::AccessDenied,
                        "You are not registered for this API, and self-registration is not possible",
                    ));
                }
                let nonce = random_token();
                self.slot().registration_nonce = Some(nonce.clone());
                let default_name = self
                    .slot()
                    .auth_response
                    .as_ref()
                    .and_then(|r| r.default_profile.name.clone())
                    .unwrap_or_default();
                let requires_namespace =
                    pool.requires_namespace && request.namespace.is_none();
                let html = templates::register_page(
                    &format!("{}/register", self.base()),
                    &nonce,
                    pool.name.as_deref().unwrap_or(&pool.id),
                    requires_namespace,
                    &default_name,
                );
                Ok(Some(Html(html).into_response()))
            }
            1 => {
                let registration = registrations.remove(0);
                if pool.requires_namespace && registration.namespace.is_none() {
                    return Err(self.fail(
                        OAuthErrorKind::InvalidRequest,
                        "Registration is missing a namespace",
                    ));
                }
                if let Some(namespace) = registration.namespace.clone() {
                    let method_id = self.method_id().to_string();
                    if let Some(req) = self
                        .session
                        .data
                        .method_mut(&method_id)
                        .auth_request
                        .as_mut()
                    {
                        req.namespace = Some(namespace);
                    }
                }
                let profile = self.profile_from_registration(&registration, &user_id);
                if let Some(response) = self.slot().auth_response.as_mut() {
                    response.profile = Some(profile);
                }
                Ok(None)
            }
            _ => {
                // Several namespaced registrations: the user picks one
                let namespaces: Vec<String> = registrations
                    .iter()
                    .filter_map(|r| r.namespace.clone())
                    .collect();
                let method_id = self.method_id().to_string();
                if let Some(req) = self
                    .session
                    .data
                    .method_mut(&method_id)
                    .auth_request
                    .as_mut()
                {
                    req.valid_namespaces = Some(namespaces.clone());
                }
                let csrf = self.session.data.issue_csrf_token();
                let html = templates::select_namespace_page(
                    &format!("{}/selectnamespace", self.base()),
                    &csrf,
                    &namespaces,
                );
                Ok(Some(Html(html).into_response()))
            }
        }
    }

    /// Decide between direct mint, passthrough scope resolution, and
    /// scope consent
    async fn authorize_decide(&mut self) -> Result<Response, FlowError> {
        let request = self.auth_request()?;
        let api = self.api().await?;

        if request.trusted || (request.scope.is_empty() && api.passthrough_scope_url.is_none()) {
            return self.mint(None).await;
        }

        if let Some(scope_url) = api.passthrough_scope_url.clone() {
            let profile = self.effective_profile();
            let resolution = resolve_passthrough_scope(
                &self.state.app.http,
                &scope_url,
                request.scope.clone(),
                profile,
            )
            .await
            .map_err(|e| self.fail(OAuthErrorKind::ServerError, e))?;
            if !resolution.allow {
                return Err(self.fail(
                    OAuthErrorKind::AccessDenied,
                    resolution
                        .error_message
                        .unwrap_or_else(|| "Scope was not granted".to_string()),
                ));
            }
            let method_id = self.method_id().to_string();
            if let Some(req) = self
                .session
                .data
                .method_mut(&method_id)
                .auth_request
                .as_mut()
            {
                req.scope = resolution.authenticated_scope.clone();
            }
            return self.mint(resolution.authenticated_userid).await;
        }

        self.scope_consent().await
    }

    /// Compare requested scopes with stored grants; render consent when
    /// grants are missing
    async fn scope_consent(&mut self) -> Result<Response, FlowError> {
        let request = self.auth_request()?;
        let user_id = self
            .slot()
            .auth_response
            .as_ref()
            .and_then(|r| r.user_id.clone())
            .ok_or_else(|| {
                self.fail(OAuthErrorKind::ServerError, "Scope consent requires a portal user")
            })?;

        let existing = self
            .state
            .app
            .portal
            .get_grant(&user_id, &request.app_id, &request.api_id)
            .await
            .map_err(|e| self.portal_fail(e))?;
        let existing_grants = existing.map(|g| g.grants).unwrap_or_default();

        let missing: Vec<String> = request
            .scope
            .iter()
            .filter(|s| !existing_grants.iter().any(|g| &g.scope == *s))
            .cloned()
            .collect();

        if missing.is_empty() {
            self.slot().grant_info = None;
            return self.mint(None).await;
        }

        self.slot().grant_info = Some(crate::session::GrantProcessInfo {
            missing_grants: missing.clone(),
            existing_grants,
        });
        let csrf = self.session.data.issue_csrf_token();
        let html = templates::consent_page(
            &format!("{}/grant", self.base()),
            &csrf,
            &request.app_id,
            &request.api_id,
            &missing,
        );
        Ok(Html(html).into_response())
    }

    /// Call the gateway, register the issued code or token in the
    /// profile store, and send the user agent back to the client
    pub async fn mint(&mut self, userid_override: Option<String>) -> Result<Response, FlowError> {
        let request = self.auth_request()?;
        let api = self.api().await?;
        let response = self
            .slot()
            .auth_response
            .clone()
            .ok_or_else(|| self.fail(OAuthErrorKind::ServerError, "No authenticated user"))?;

        if !api.passthrough_users && response.user_id.is_none() {
            return Err(self.fail(
                OAuthErrorKind::ServerError,
                "Token issuance requires a portal user for this API",
            ));
        }

        let profile = self.effective_profile();
        let authenticated_userid = match userid_override {
            Some(userid) => userid,
            None => build_authenticated_userid(
                api.passthrough_users,
                response.user_id.as_deref(),
                &profile,
                request.namespace.as_deref(),
            ),
        };

        let scope = merge_group_scopes(
            &request.scope,
            response.groups.as_deref().unwrap_or_default(),
        );

        let params = AuthorizeParams {
            response_type: request.response_type,
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            authenticated_userid: authenticated_userid.clone(),
            scope,
        };
        let render = self.render_mode();
        let authorized = self
            .state
            .app
            .gateway
            .authorize(&request.api_id, &params)
            .await
            .map_err(|e| FlowError::from_gateway(e, render))?;

        // The profile binding must exist before the user agent can come
        // back with the code or token
        let key = extract_token_or_code(&authorized.redirect_uri).ok_or_else(|| {
            self.fail(
                OAuthErrorKind::ServerError,
                "Gateway redirect carries neither a code nor a token",
            )
        })?;
        self.state
            .app
            .profiles
            .register_token_or_code(&key, &request.api_id, &profile)
            .await
            .map_err(|e| self.fail(OAuthErrorKind::ServerError, e))?;

        info!(
            "Authorized {} for client {} on API {} (response_type {})",
            authenticated_userid,
            request.client_id,
            request.api_id,
            request.response_type.as_str()
        );

        self.slot().grant_info = None;

        let mut location = authorized.redirect_uri;
        if let Some(state) = &request.state {
            location.push_str("&state=");
            location.push_str(&urlencode(state));
        }
        if let Some(namespace) = &request.namespace {
            location.push_str("&namespace=");
            location.push_str(&urlencode(namespace));
        }
        Ok(Redirect::to(&location).into_response())
    }

    /// The effective profile: the reconciled one when set, else the IdP
    /// default
    pub fn effective_profile(&self) -> OidcProfile {
        self.session
            .data
            .method(self.state.method_id())
            .and_then(|m| m.auth_response.as_ref())
            .map(|r| r.profile.clone().unwrap_or_else(|| r.default_profile.clone()))
            .unwrap_or_default()
    }

    /// Default profile with the subject replaced by the portal user id
    /// when one exists
    fn effective_default_profile(&mut self) -> OidcProfile {
        let response = self.slot().auth_response.clone();
        match response {
            Some(response) => {
                let mut profile = response.default_profile.clone();
                if let Some(user_id) = &response.user_id {
                    profile.sub = user_id.clone();
                }
                profile
            }
            None => OidcProfile::default(),
        }
    }

    fn profile_from_registration(
        &mut self,
        registration: &Registration,
        user_id: &str,
    ) -> OidcProfile {
        let mut profile = self.effective_default_profile();
        profile.sub = user_id.to_string();
        if let Some(name) = &registration.name {
            profile.name = Some(name.clone());
        }
        profile
    }
}

/// Resolve or create the portal user behind an auth response. For
/// passthrough APIs the portal user id is cleared and no portal call is
/// made; otherwise the user is looked up by id or custom id, created on
/// first federated login, and the group lists are merged. Shared by the
/// authorize flow and the password grant.
pub async fn reconcile_user_response(
    portal: &crate::portal::PortalClient,
    passthrough: bool,
    response: &mut crate::session::AuthResponse,
) -> Result<(), (OAuthErrorKind, String)> {
    if passthrough {
        response.user_id = None;
        response.groups = Some(Vec::new());
        return Ok(());
    }

    let portal_fail =
        |e: PortalError| (OAuthErrorKind::ServerError, format!("Portal API request failed: {e}"));

    let user = if let Some(user_id) = &response.user_id {
        portal
            .get_user_opt(user_id)
            .await
            .map_err(portal_fail)?
            .ok_or_else(|| {
                (
                    OAuthErrorKind::InvalidRequest,
                    format!("Unknown user {user_id}"),
                )
            })?
    } else if let Some(custom_id) = &response.custom_id {
        let matches = portal
            .find_users_by_custom_id(custom_id)
            .await
            .map_err(portal_fail)?;
        match matches.first() {
            Some(short) => portal.get_user(&short.id).await.map_err(portal_fail)?,
            None => {
                // First login of a federated identity: create the user
                let email = response.default_profile.email.clone().ok_or_else(|| {
                    (
                        OAuthErrorKind::ServerError,
                        "Identity provider did not supply an email address".to_string(),
                    )
                })?;
                let new_user = NewUser {
                    email,
                    custom_id: Some(custom_id.clone()),
                    validated: response.default_profile.email_verified.unwrap_or(false),
                    password: None,
                };
                let created = portal.create_user(&new_user).await.map_err(|e| match e {
                    PortalError::DuplicateEmail => (
                        OAuthErrorKind::InvalidRequest,
                        "A user with this email address already exists; log in with the original identity instead"
                            .to_string(),
                    ),
                    other => portal_fail(other),
                })?;
                info!(
                    "Created portal user {} for custom id {custom_id}",
                    created.id
                );
                created
            }
        }
    } else {
        return Err((
            OAuthErrorKind::ServerError,
            "Identity provider supplied neither a user id nor a custom id".to_string(),
        ));
    };

    let mut groups = user.groups.clone();
    for group in &response.default_groups {
        if !groups.contains(group) {
            groups.push(group.clone());
        }
    }
    response.user_id = Some(user.id);
    response.groups = Some(groups);
    Ok(())
}

/// Base path of a method's router, e.g. `/auth/local`
pub fn method_base(state: &MethodState) -> String {
    format!(
        "{}/{}",
        state.app.config.base_path.trim_end_matches('/'),
        state.method_id()
    )
}

/// Authenticated user id format: passthrough APIs forward the IdP
/// subject verbatim, portal-managed users get `sub=<id>` with an
/// optional `;namespace=<ns>` suffix
pub fn build_authenticated_userid(
    passthrough: bool,
    user_id: Option<&str>,
    profile: &OidcProfile,
    namespace: Option<&str>,
) -> String {
    if passthrough {
        return profile.sub.clone();
    }
    let user_id = user_id.unwrap_or(&profile.sub);
    match namespace {
        Some(namespace) => format!("sub={user_id};namespace={namespace}"),
        None => format!("sub={user_id}"),
    }
}

/// Union of the validated scopes and one `wicked:<group>` synthetic
/// scope per portal group
pub fn merge_group_scopes(scope: &[String], groups: &[String]) -> Vec<String> {
    let mut merged = scope.to_vec();
    for group in groups {
        let synthetic = format!("{GROUP_SCOPE_PREFIX}{group}");
        if !merged.contains(&synthetic) {
            merged.push(synthetic);
        }
    }
    merged
}

/// Strip synthetic group scopes before re-resolving scope on refresh
pub fn strip_group_scopes(scope: &[String]) -> Vec<String> {
    scope
        .iter()
        .filter(|s| !s.starts_with(GROUP_SCOPE_PREFIX))
        .cloned()
        .collect()
}

/// Pull the authorization code or (implicit) access token out of the
/// redirect URI the gateway returned
pub fn extract_token_or_code(redirect_uri: &str) -> Option<String> {
    let url = url::Url::parse(redirect_uri).ok()?;
    if let Some(code) = url
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
    {
        return Some(code);
    }
    let fragment = url.fragment()?;
    url::form_urlencoded::parse(fragment.as_bytes())
        .find(|(k, _)| k == "access_token")
        .map(|(_, v)| v.to_string())
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// POST scope and profile to the external resolver; up to 10 attempts at
/// 500 ms intervals on network errors or non-2xx answers
pub async fn resolve_passthrough_scope(
    http: &reqwest::Client,
    scope_url: &str,
    scope: Vec<String>,
    profile: OidcProfile,
) -> Result<PassthroughScopeResponse, String> {
    let request = PassthroughScopeRequest { scope, profile };
    let mut last_error = String::new();
    for attempt in 1..=10 {
        match http.post(scope_url).json(&request).send().await {
            Ok(response) if response.status().is_success() => {
                return response
                    .json::<PassthroughScopeResponse>()
                    .await
                    .map_err(|e| format!("Invalid scope resolver response: {e}"));
            }
            Ok(response) => {
                last_error = format!("Scope resolver returned {}", response.status());
            }
            Err(e) => {
                last_error = format!("Scope resolver not reachable: {e}");
            }
        }
        warn!("Passthrough scope attempt {attempt}/10 failed: {last_error}");
        if attempt < 10 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
    Err(last_error)
}
