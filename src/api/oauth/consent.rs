//! Scope consent continuation: the allow/deny post of the consent page.
//! Allowing persists the union of existing and missing grants in the
//! portal, then re-enters the flow, which now finds nothing missing.

use super::error::{FlowError, OAuthErrorKind};
use super::flow::Flow;
use super::models::GrantForm;
use crate::portal::models::{ApiGrant, ScopeGrant};
use crate::session::SessionHandle;
use crate::state::MethodState;
use axum::extract::State;
use axum::response::Response;
use axum::Form;
use axum_extra::extract::SignedCookieJar;
use log::info;

/// POST /grant — the user allowed or denied the requested scopes
pub async fn grant_post(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
    Form(form): Form<GrantForm>,
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
    let result = grant_inner(&state, &mut session, form).await;
    super::finish(&state, jar, session, result).await
}

async fn grant_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    form: GrantForm,
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

    if form.action == "deny" {
        let flow = Flow::new(state, session);
        let render = flow.render_mode();
        return Err(FlowError::new(
            OAuthErrorKind::AccessDenied,
            "The user denied access to the requested scopes",
            render,
        ));
    }
    if form.action != "allow" {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            format!("Unknown consent action {}", form.action),
        ));
    }

    let grant_info = session
        .data
        .method(&method_id)
        .and_then(|m| m.grant_info.clone())
        .ok_or_else(|| {
            FlowError::page(
                OAuthErrorKind::InvalidRequest,
                "There is no consent decision in progress",
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

    // Union of what was granted before and what was just allowed
    let mut grants = grant_info.existing_grants.clone();
    for scope in &grant_info.missing_grants {
        if !grants.iter().any(|g| &g.scope == scope) {
            grants.push(ScopeGrant {
                scope: scope.clone(),
            });
        }
    }
    let grant = ApiGrant {
        user_id: Some(user_id.clone()),
        application_id: Some(request.app_id.clone()),
        api_id: Some(request.api_id.clone()),
        grants,
    };
    let render = Flow::new(state, session).render_mode();
    state
        .app
        .portal
        .put_grant(&user_id, &request.app_id, &request.api_id, &grant)
        .await
        .map_err(|e| FlowError::from_portal(e, render))?;
    info!(
        "User {user_id} granted scopes {:?} to application {} for API {}",
        grant_info.missing_grants, request.app_id, request.api_id
    );

    let mut flow = Flow::new(state, session);
    flow.continue_authorize().await
}
