//! Login page and plain-login entry, logout, and the failure page.
//!
//! The login page serves two situations: continuing an authorize flow
//! (the IdP redirected here), and the plain login mode entered via
//! `GET /login?redirect_uri=...`, which authenticates the user and
//! returns to the caller without involving the gateway.

use super::error::{FlowError, OAuthErrorKind};
use super::flow::{method_base, Flow};
use super::models::LoginForm;
use super::templates;
use crate::gateway::models::ResponseType;
use crate::idp::IdpError;
use crate::session::{AuthRequest, SessionHandle, SESSION_COOKIE_NAME};
use crate::state::MethodState;
use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Form;
use axum_extra::extract::cookie::Cookie;
use axum_extra::extract::SignedCookieJar;
use http::StatusCode;
use log::{debug, info};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// GET /login — render the login form; with a `redirect_uri` parameter
/// this enters plain login mode
pub async fn login_get(
    State(state): State<MethodState>,
    Query(query): Query<LoginQuery>,
    jar: SignedCookieJar,
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
    let result = login_get_inner(&state, &mut session, query).await;
    super::finish(&state, jar, session, result).await
}

async fn login_get_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    query: LoginQuery,
) -> Result<Response, FlowError> {
    let method_id = state.method_id().to_string();

    if let Some(redirect_uri) = query.redirect_uri.filter(|r| !r.is_empty()) {
        // Plain login: fabricate a minimal auth request that only knows
        // where to return to
        debug!("Plain login requested, returning to {redirect_uri}");
        let slot = session.data.method_mut(&method_id);
        slot.auth_request = Some(AuthRequest {
            api_id: String::new(),
            client_id: String::new(),
            response_type: ResponseType::Code,
            redirect_uri: redirect_uri.clone(),
            state: None,
            scope: Vec::new(),
            prompt: None,
            namespace: None,
            trusted: false,
            scopes_differ: false,
            plain: true,
            app_id: String::new(),
            valid_namespaces: None,
        });
        session.data.redirect_uri = Some(redirect_uri);
    } else if session
        .data
        .method(&method_id)
        .and_then(|m| m.auth_request.as_ref())
        .is_none()
    {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            "There is no authorization request in progress; missing redirect_uri",
        ));
    }

    let csrf = session.data.issue_csrf_token();
    let html = templates::login_page(&format!("{}/login", method_base(state)), &csrf, None);
    Ok(Html(html).into_response())
}

/// POST /login — authenticate the user with the method's IdP and
/// continue the flow
pub async fn login_post(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
    Form(form): Form<LoginForm>,
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
    let result = login_post_inner(&state, &mut session, form).await;
    super::finish(&state, jar, session, result).await
}

async fn login_post_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    form: LoginForm,
) -> Result<Response, FlowError> {
    if !session.data.consume_csrf_token(&form.csrf_token) {
        return Err(FlowError::page(
            OAuthErrorKind::AccessDenied,
            "The form token is missing or no longer valid",
        )
        .delayed());
    }

    let method_id = state.method_id().to_string();
    if session
        .data
        .method(&method_id)
        .and_then(|m| m.auth_request.as_ref())
        .is_none()
    {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            "There is no authorization request in progress",
        ));
    }

    match state
        .idp
        .authorize_by_user_pass(&form.username, &form.password)
        .await
    {
        Ok(auth_response) => {
            info!(
                "Login via {} succeeded for sub {}",
                method_id, auth_response.default_profile.sub
            );
            session.data.method_mut(&method_id).auth_response = Some(auth_response);
            let mut flow = Flow::new(state, session);
            flow.continue_authorize().await
        }
        Err(IdpError::InvalidCredentials) => {
            // Authentication failures answer no earlier than 500 ms
            tokio::time::sleep(Duration::from_millis(500)).await;
            let csrf = session.data.issue_csrf_token();
            let html = templates::login_page(
                &format!("{}/login", method_base(state)),
                &csrf,
                Some("Invalid email address or password"),
            );
            Ok((StatusCode::OK, Html(html)).into_response())
        }
        Err(e) => {
            let flow = Flow::new(state, session);
            let render = flow.render_mode();
            Err(FlowError::new(
                OAuthErrorKind::ServerError,
                format!("Identity provider failed: {e}"),
                render,
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogoutQuery {
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// GET /logout — destroy the session; redirect when asked to
pub async fn logout_get(
    State(state): State<MethodState>,
    Query(query): Query<LogoutQuery>,
    jar: SignedCookieJar,
) -> Response {
    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
        state.app.sessions.destroy(cookie.value()).await;
    }
    let jar = jar.remove(Cookie::from(SESSION_COOKIE_NAME));
    match query.redirect_uri.filter(|r| !r.is_empty()) {
        Some(redirect_uri) => (jar, Redirect::to(&redirect_uri)).into_response(),
        None => (jar, Html(templates::logout_page())).into_response(),
    }
}

/// GET /failure — the last remembered error, with a way back to the
/// application when the session still knows one
pub async fn failure_get(State(state): State<MethodState>, jar: SignedCookieJar) -> Response {
    let session = state.app.sessions.load(&jar).await.ok().flatten();
    let (message, status, redirect_uri) = match session.as_ref() {
        Some(handle) => (
            handle
                .data
                .last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "There is no recent error".to_string()),
            handle
                .data
                .last_error
                .as_ref()
                .and_then(|e| StatusCode::from_u16(e.status).ok())
                .unwrap_or(StatusCode::OK),
            handle.data.redirect_uri.clone(),
        ),
        None => (
            "There is no active session".to_string(),
            StatusCode::OK,
            None,
        ),
    };
    (
        status,
        Html(templates::error_page(
            status,
            "failure",
            &message,
            redirect_uri.as_deref(),
        )),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use crate::test_utils::TestFixture;
    use http::StatusCode;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_portal_login(portal_mock: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u1", "email": "u1@ex", "validated": true, "groups": []
            })))
            .mount(portal_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u1", "email": "u1@ex", "validated": true, "groups": []
            })))
            .mount(portal_mock)
            .await;
    }

    #[tokio::test]
    async fn test_plain_login_returns_to_redirect_uri() {
        let fixture = TestFixture::new().await;
        mount_portal_login(&fixture.portal_mock).await;

        let page = fixture
            .get("/auth/local/login?redirect_uri=https%3A%2F%2Fportal.example%2Fback")
            .await;
        page.assert_status(StatusCode::OK);
        let csrf = page.csrf_token().expect("login page has a form token");
        let cookies = page.cookies();

        let done = fixture
            .post_form(
                "/auth/local/login",
                &format!("username=u1%40ex&password=pw&csrf_token={csrf}"),
                Some(&cookies),
            )
            .await;
        done.assert_status(StatusCode::SEE_OTHER);
        assert_eq!(done.location(), "https://portal.example/back");
    }

    #[tokio::test]
    async fn test_login_without_pending_request_fails() {
        let fixture = TestFixture::new().await;
        let response = fixture.get("/auth/local/login").await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_credentials_rerender_login_slowly() {
        let fixture = TestFixture::new().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&fixture.portal_mock)
            .await;

        let page = fixture
            .get("/auth/local/login?redirect_uri=https%3A%2F%2Fportal.example%2Fback")
            .await;
        let csrf = page.csrf_token().unwrap();
        let cookies = page.cookies();

        let start = std::time::Instant::now();
        let retry = fixture
            .post_form(
                "/auth/local/login",
                &format!("username=u1%40ex&password=nope&csrf_token={csrf}"),
                Some(&cookies),
            )
            .await;
        retry.assert_status(StatusCode::OK);
        assert!(retry.text().contains("Invalid email address or password"));
        assert!(start.elapsed() >= std::time::Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_logout_destroys_session_and_failure_forgets_it() {
        let fixture = TestFixture::new().await;

        // Seed a session with a remembered error via a CSRF failure
        let page = fixture
            .get("/auth/local/login?redirect_uri=https%3A%2F%2Fportal.example%2Fback")
            .await;
        let cookies = page.cookies();
        let forbidden = fixture
            .post_form(
                "/auth/local/login",
                "username=u&password=p&csrf_token=forged",
                Some(&cookies),
            )
            .await;
        forbidden.assert_status(StatusCode::FORBIDDEN);

        // The failure page remembers the error and the redirect URI
        let failure = fixture
            .get_with_cookies("/auth/local/failure", &cookies)
            .await;
        failure.assert_status(StatusCode::FORBIDDEN);
        assert!(failure.text().contains("form token"));
        assert!(failure.text().contains("https://portal.example/back"));

        // Logout destroys the session record
        let logout = fixture
            .get_with_cookies(
                "/auth/local/logout?redirect_uri=https%3A%2F%2Fportal.example%2F",
                &cookies,
            )
            .await;
        logout.assert_status(StatusCode::SEE_OTHER);

        let after = fixture
            .get_with_cookies("/auth/local/failure", &cookies)
            .await;
        after.assert_status(StatusCode::OK);
        assert!(after.text().contains("no active session"));
    }
}
