//! Grant manager: lets a logged-in user review and revoke the scope
//! grants they have given to applications, per API. Mounted under each
//! auth method at `/grants`.

use crate::api::oauth::error::{FlowError, OAuthErrorKind};
use crate::api::oauth::flow::method_base;
use crate::api::oauth::models::RevokeGrantForm;
use crate::api::oauth::templates;
use crate::session::SessionHandle;
use crate::state::MethodState;
use axum::extract::State;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Form;
use axum::Router;
use axum_extra::extract::SignedCookieJar;
use log::{info, warn};

pub fn router() -> Router<MethodState> {
    Router::new().route("/", get(grants_get).post(grants_post))
}

async fn load_session(
    state: &MethodState,
    jar: &SignedCookieJar,
) -> Result<SessionHandle, FlowError> {
    state.app.sessions.load_or_new(jar).await.map_err(|e| {
        FlowError::page(
            OAuthErrorKind::ServerError,
            format!("Session storage is unavailable: {e}"),
        )
    })
}

fn logged_in_user(state: &MethodState, session: &SessionHandle) -> Result<String, FlowError> {
    session
        .data
        .method(state.method_id())
        .filter(|m| m.is_logged_in())
        .and_then(|m| m.auth_response.as_ref())
        .and_then(|r| r.user_id.clone())
        .ok_or_else(|| {
            FlowError::page(
                OAuthErrorKind::AccessDenied,
                "You must be logged in to manage your grants",
            )
        })
}

/// GET /grants — list the user's grants with display names
async fn grants_get(State(state): State<MethodState>, jar: SignedCookieJar) -> Response {
    let mut session = match load_session(&state, &jar).await {
        Ok(session) => session,
        Err(e) => return e.render().await,
    };
    let result = grants_get_inner(&state, &mut session).await;
    crate::api::oauth::finish(&state, jar, session, result).await
}

async fn grants_get_inner(
    state: &MethodState,
    session: &mut SessionHandle,
) -> Result<Response, FlowError> {
    let user_id = logged_in_user(state, session)?;
    let grants = state
        .app
        .portal
        .get_grants(&user_id)
        .await
        .map_err(|e| FlowError::from_portal(e, crate::api::oauth::error::ErrorRender::Page))?;

    let mut rows = Vec::with_capacity(grants.len());
    for grant in &grants {
        let application_id = grant.application_id.clone().unwrap_or_default();
        let api_id = grant.api_id.clone().unwrap_or_default();
        // Display info is cosmetic; lookups falling over must not take
        // the page down
        let application_name = match state.app.portal.get_application(&application_id).await {
            Ok(Some(application)) => application.display_name().to_string(),
            Ok(None) => format!("(unknown application {application_id})"),
            Err(e) => {
                warn!("Application lookup failed for {application_id}: {e}");
                format!("(unknown application {application_id})")
            }
        };
        let api_name = match state.app.portal.get_api_cached(&api_id).await {
            Ok(api) => api.display_name().to_string(),
            Err(e) => {
                warn!("API lookup failed for {api_id}: {e}");
                format!("(unknown API {api_id})")
            }
        };
        let scopes = grant
            .grants
            .iter()
            .map(|g| g.scope.clone())
            .collect::<Vec<_>>()
            .join(" ");
        rows.push((application_id, application_name, api_id, api_name, scopes));
    }

    let csrf = session.data.issue_csrf_token();
    let html = templates::grants_page(&format!("{}/grants", method_base(state)), &csrf, &rows);
    Ok(Html(html).into_response())
}

/// POST /grants — revoke one (application, API) grant
async fn grants_post(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
    Form(form): Form<RevokeGrantForm>,
) -> Response {
    let mut session = match load_session(&state, &jar).await {
        Ok(session) => session,
        Err(e) => return e.render().await,
    };
    let result = grants_post_inner(&state, &mut session, form).await;
    crate::api::oauth::finish(&state, jar, session, result).await
}

async fn grants_post_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    form: RevokeGrantForm,
) -> Result<Response, FlowError> {
    if !session.data.consume_csrf_token(&form.csrf_token) {
        return Err(FlowError::page(
            OAuthErrorKind::AccessDenied,
            "The form token is missing or no longer valid",
        )
        .delayed());
    }
    let user_id = logged_in_user(state, session)?;
    if form.application_id.is_empty() || form.api_id.is_empty() {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            "application_id and api_id are required",
        ));
    }

    state
        .app
        .portal
        .delete_grant(&user_id, &form.application_id, &form.api_id)
        .await
        .map_err(|e| FlowError::from_portal(e, crate::api::oauth::error::ErrorRender::Page))?;
    info!(
        "User {user_id} revoked the grant for application {} on API {}",
        form.application_id, form.api_id
    );

    Ok(Redirect::to(&format!("{}/grants", method_base(state))).into_response())
}
