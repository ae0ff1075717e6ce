//! Registration continuations: the registration form post and the
//! namespace selection post. Both re-enter the flow orchestrator, which
//! re-evaluates the registration state with the new data in place.

use super::error::{FlowError, OAuthErrorKind};
use super::flow::Flow;
use super::models::{RegisterForm, SelectNamespaceForm};
use crate::portal::models::Registration;
use crate::session::SessionHandle;
use crate::state::MethodState;
use axum::extract::State;
use axum::response::Response;
use axum::Form;
use axum_extra::extract::SignedCookieJar;
use log::info;
use std::collections::HashMap;

/// POST /register — persist the user's registration in the pool
pub async fn register_post(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
    Form(form): Form<RegisterForm>,
) -> Response {
    let mut session = match state.app.sessions.load_or_new(&jar).await {
        Ok(session) => session,
        Err(e) => {
            return FlowError::page(
                OAuthErrorKind::ServerError,
                format!("Session storage is unavailable: {e}"),
            )
            .render()
            .await;
        }
    };
    let result = register_inner(&state, &mut session, form).await;
    super::finish(&state, jar, session, result).await
}

async fn register_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    form: RegisterForm,
) -> Result<Response, FlowError> {
    let method_id = state.method_id().to_string();

    // The nonce is the single-use token of the registration form
    let nonce = session
        .data
        .method_mut(&method_id)
        .registration_nonce
        .take();
    if nonce.as_deref() != Some(form.nonce.as_str()) || form.nonce.is_empty() {
        return Err(FlowError::page(
            OAuthErrorKind::AccessDenied,
            "The registration form token is missing or no longer valid",
        )
        .delayed());
    }

    let request = session
        .data
        .method(&method_id)
        .and_then(|m| m.auth_request.clone())
        .ok_or_else(|| {
            FlowError::page(
                OAuthErrorKind::InvalidRequest,
                "There is no authorization request in progress",
            )
        })?;
    let user_id = session
        .data
        .method(&method_id)
        .and_then(|m| m.auth_response.as_ref())
        .and_then(|r| r.user_id.clone())
        .ok_or_else(|| {
            FlowError::page(OAuthErrorKind::ServerError, "No authenticated portal user")
        })?;

    let api = state
        .app
        .portal
        .get_api_cached(&request.api_id)
        .await
        .map_err(|e| FlowError::from_portal(e, super::error::ErrorRender::Page))?;
    let pool_id = api.registration_pool.clone().ok_or_else(|| {
        FlowError::page(
            OAuthErrorKind::InvalidRequest,
            "This API has no registration pool",
        )
    })?;
    let pool = state
        .app
        .portal
        .get_pool(&pool_id)
        .await
        .map_err(|e| FlowError::from_portal(e, super::error::ErrorRender::Page))?;

    if form.name.trim().is_empty() {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            "A name is required for registration",
        ));
    }

    let namespace = form
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| request.namespace.clone());
    if pool.requires_namespace && namespace.is_none() {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            format!("Pool {pool_id} requires a namespace"),
        ));
    }

    let registration = Registration {
        pool_id: Some(pool_id.clone()),
        user_id: Some(user_id.clone()),
        namespace: namespace.clone(),
        name: Some(form.name.trim().to_string()),
        data: HashMap::new(),
    };
    state
        .app
        .portal
        .upsert_registration(&pool_id, &user_id, &registration)
        .await
        .map_err(|e| FlowError::from_portal(e, super::error::ErrorRender::Page))?;
    info!(
        "Registered user {user_id} in pool {pool_id} (namespace {:?})",
        namespace
    );

    if let Some(namespace) = namespace {
        if let Some(req) = session
            .data
            .method_mut(&method_id)
            .auth_request
            .as_mut()
        {
            req.namespace = Some(namespace);
        }
    }

    // Back into the flow; the fresh registration is picked up there
    let mut flow = Flow::new(state, session);
    flow.continue_authorize().await
}

/// POST /selectnamespace — the user picked one of their registrations
pub async fn select_namespace_post(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
    Form(form): Form<SelectNamespaceForm>,
) -> Response {
    let mut session = match state.app.sessions.load_or_new(&jar).await {
        Ok(session) => session,
        Err(e) => {
            return FlowError::page(
                OAuthErrorKind::ServerError,
                format!("Session storage is unavailable: {e}"),
            )
            .render()
            .await;
        }
    };
    let result = select_namespace_inner(&state, &mut session, form).await;
    super::finish(&state, jar, session, result).await
}

async fn select_namespace_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    form: SelectNamespaceForm,
) -> Result<Response, FlowError> {
    if !session.data.consume_csrf_token(&form.csrf_token) {
        return Err(FlowError::page(
            OAuthErrorKind::AccessDenied,
            "The form token is missing or no longer valid",
        )
        .delayed());
    }

    let method_id = state.method_id().to_string();
    let request = session
        .data
        .method(&method_id)
        .and_then(|m| m.auth_request.clone())
        .ok_or_else(|| {
            FlowError::page(
                OAuthErrorKind::InvalidRequest,
                "There is no authorization request in progress",
            )
        })?;

    let valid = request
        .valid_namespaces
        .as_deref()
        .unwrap_or_default()
        .contains(&form.namespace);
    if !valid {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            format!("Namespace {} is not selectable", form.namespace),
        ));
    }

    if let Some(req) = session
        .data
        .method_mut(&method_id)
        .auth_request
        .as_mut()
    {
        req.namespace = Some(form.namespace.clone());
    }

    let mut flow = Flow::new(state, session);
    flow.continue_authorize().await
}
