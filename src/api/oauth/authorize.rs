//! The authorize endpoint: request validation, scope validation against
//! the API's catalogue, session checks, and hand-off to either the IdP's
//! login UI or the flow orchestrator.

use super::error::{FlowError, OAuthErrorKind};
use super::flow::Flow;
use super::models::AuthorizeQuery;
use crate::gateway::models::ResponseType;
use crate::idp::UiAuthorization;
use crate::portal::PortalError;
use crate::session::{AuthRequest, Prompt, SessionHandle};
use crate::state::MethodState;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::SignedCookieJar;
use log::debug;

/// GET /api/:apiId/authorize
pub async fn authorize_get(
    State(state): State<MethodState>,
    Path(api_id): Path<String>,
    Query(query): Query<AuthorizeQuery>,
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
    let result = authorize_inner(&state, &mut session, &api_id, query).await;
    super::finish(&state, jar, session, result).await
}

async fn authorize_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    api_id: &str,
    query: AuthorizeQuery,
) -> Result<Response, FlowError> {
    // Client and redirect URI must check out before any error may be
    // redirected back to the client
    let client_id = query
        .client_id
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| FlowError::page(OAuthErrorKind::InvalidRequest, "client_id is required"))?;

    let subscription_info = state
        .app
        .portal
        .get_subscription(client_id)
        .await
        .map_err(|e| match e {
            PortalError::NotFound(_) => FlowError::page(
                OAuthErrorKind::InvalidClient,
                format!("Unknown client id {client_id}"),
            ),
            other => FlowError::from_portal(other, super::error::ErrorRender::Page),
        })?;

    if subscription_info.subscription.api != api_id {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            format!("The client is not subscribed to API {api_id}"),
        ));
    }

    let redirect_uri = query
        .redirect_uri
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            FlowError::page(OAuthErrorKind::InvalidRequest, "redirect_uri is required")
        })?;
    let registered = subscription_info.application.all_redirect_uris();
    if !registered.iter().any(|uri| *uri == redirect_uri) {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            "The redirect_uri does not match the registered redirect URI of the application",
        ));
    }

    // From here on, errors travel back to the client
    let fail = |kind: OAuthErrorKind, description: String| {
        FlowError::redirect(kind, description, redirect_uri, query.state.clone())
    };

    let response_type = match query.response_type.as_deref() {
        Some("code") => ResponseType::Code,
        Some("token") => ResponseType::Token,
        other => {
            return Err(fail(
                OAuthErrorKind::UnsupportedResponseType,
                format!(
                    "response_type must be code or token, got {}",
                    other.unwrap_or("nothing")
                ),
            ));
        }
    };

    let api = state
        .app
        .portal
        .get_api_cached(api_id)
        .await
        .map_err(|e| match e {
            PortalError::NotFound(_) => {
                fail(OAuthErrorKind::InvalidRequest, format!("Unknown API {api_id}"))
            }
            other => FlowError::from_portal(
                other,
                super::error::ErrorRender::Redirect {
                    redirect_uri: redirect_uri.to_string(),
                    state: query.state.clone(),
                },
            ),
        })?;

    if !api.auth_methods.is_empty()
        && !api.auth_methods.iter().any(|m| m == state.method_id())
    {
        return Err(fail(
            OAuthErrorKind::UnauthorizedClient,
            format!(
                "API {api_id} does not allow the auth method {}",
                state.method_id()
            ),
        ));
    }

    // Scope validation: untrusted subscriptions may only ask for
    // catalogued scopes; trusted ones always receive the full catalogue
    let requested: Vec<String> = query
        .scope
        .as_deref()
        .map(|s| s.split_whitespace().map(|p| p.to_string()).collect())
        .unwrap_or_default();
    let catalogue = api.scope_names();
    let (scope, scopes_differ) = if subscription_info.subscription.trusted {
        (catalogue, true)
    } else {
        for scope_name in &requested {
            if !catalogue.contains(scope_name) {
                return Err(fail(
                    OAuthErrorKind::InvalidScope,
                    format!("Scope {scope_name} is not known for API {api_id}"),
                ));
            }
        }
        (requested, false)
    };

    let prompt = match query.prompt.as_deref() {
        Some("none") => Some(Prompt::None),
        Some("login") => Some(Prompt::Login),
        _ => None,
    };

    let auth_request = AuthRequest {
        api_id: api_id.to_string(),
        client_id: client_id.to_string(),
        response_type,
        redirect_uri: redirect_uri.to_string(),
        state: query.state.clone(),
        scope,
        prompt,
        namespace: query.namespace.clone(),
        trusted: subscription_info.subscription.trusted,
        scopes_differ,
        plain: false,
        app_id: subscription_info.application.id.clone(),
        valid_namespaces: None,
    };
    debug!(
        "Authorize request for API {api_id}, client {client_id}, trusted={}, scope={:?}",
        auth_request.trusted, auth_request.scope
    );

    // A new authorize call replaces any previous request of this method;
    // the auth response survives for session continuity
    let method_id = state.method_id().to_string();
    {
        let slot = session.data.method_mut(&method_id);
        slot.auth_request = Some(auth_request);
        slot.grant_info = None;
        slot.registration_nonce = None;
    }
    session.data.redirect_uri = Some(redirect_uri.to_string());

    let logged_in = session
        .data
        .method(&method_id)
        .map(|m| m.is_logged_in())
        .unwrap_or(false);

    match prompt {
        Some(Prompt::None) if !logged_in => {
            return Err(fail(
                OAuthErrorKind::LoginRequired,
                "The user is not logged in, and prompt=none was requested".to_string(),
            ));
        }
        Some(Prompt::Login) => {
            // Forced re-login wipes the previous authentication
            session.data.method_mut(&method_id).auth_response = None;
        }
        _ => {}
    }

    if logged_in && prompt != Some(Prompt::Login) {
        let mut flow = Flow::new(state, session);
        return flow.continue_authorize().await;
    }

    login_ui(state, session).await
}

/// Hand over to the IdP for interactive authentication
async fn login_ui(state: &MethodState, session: &mut SessionHandle) -> Result<Response, FlowError> {
    match state.idp.authorize_with_ui().await {
        Ok(UiAuthorization::Redirect(path)) => {
            let target = format!(
                "{}/{}",
                super::flow::method_base(state),
                path.trim_start_matches('/')
            );
            Ok(Redirect::to(&target).into_response())
        }
        Ok(UiAuthorization::Authenticated(auth_response)) => {
            let method_id = state.method_id().to_string();
            session.data.method_mut(&method_id).auth_response = Some(auth_response);
            let mut flow = Flow::new(state, session);
            flow.continue_authorize().await
        }
        Err(e) => {
            let flow = Flow::new(state, session);
            Err(FlowError::new(
                OAuthErrorKind::ServerError,
                format!("Identity provider failed: {e}"),
                flow.render_mode(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::TestFixture;
    use http::StatusCode;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, ResponseTemplate};

    const AUTHORIZE_URI: &str = "/auth/dummy/api/api1/authorize?response_type=code&client_id=CID\
&redirect_uri=https%3A%2F%2Fc.example%2Fcb&state=xyz&scope=read";

    #[tokio::test]
    async fn test_authorization_code_happy_path_binds_profile() {
        let fixture = TestFixture::new().await;
        fixture.mount_default_portal(false, true).await;
        fixture.mount_default_gateway().await;

        // The user already granted the read scope earlier
        Mock::given(method("GET"))
            .and(path("/grants/u1/applications/app1/apis/api1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "userId": "u1", "applicationId": "app1", "apiId": "api1",
                "grants": [ { "scope": "read" } ]
            })))
            .mount(&fixture.portal_mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/api1/oauth2/authorize"))
            .and(body_partial_json(serde_json::json!({
                "response_type": "code",
                "client_id": "CID",
                "authenticated_userid": "sub=u1",
                "scope": "read"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "redirect_uri": "https://c.example/cb?code=THECODE"
            })))
            .mount(&fixture.gateway_mock)
            .await;

        // Authorize: the dummy method logs the user in without UI
        let response = fixture.get(AUTHORIZE_URI).await;
        response.assert_status(StatusCode::SEE_OTHER);
        let location = response.location();
        assert!(location.contains("code=THECODE"), "location: {location}");
        assert!(location.contains("state=xyz"), "location: {location}");

        // Exchange the code for a token
        Mock::given(method("POST"))
            .and(path("/api1/oauth2/token"))
            .and(body_partial_json(serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": "CID",
                "client_secret": "SECRET",
                "code": "THECODE",
                "redirect_uri": "https://c.example/cb"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT",
                "token_type": "bearer",
                "expires_in": 3600,
                "refresh_token": "RT"
            })))
            .mount(&fixture.gateway_mock)
            .await;

        let token_response = fixture
            .post_form(
                "/auth/dummy/api/api1/token",
                "grant_type=authorization_code&client_id=CID&client_secret=SECRET\
&code=THECODE&redirect_uri=https%3A%2F%2Fc.example%2Fcb",
                None,
            )
            .await;
        token_response.assert_status(StatusCode::OK);
        assert_eq!(token_response.json()["access_token"], "AT");

        // The code entry is gone, the access token resolves the profile
        assert!(fixture
            .state
            .profiles
            .retrieve("THECODE")
            .await
            .unwrap()
            .is_none());
        let profile_request = fixture
            .request_builder(http::Method::GET, "/auth/dummy/profile")
            .header("Authorization", "Bearer AT")
            .body(axum::body::Body::empty())
            .unwrap();
        let profile_response = fixture.send(profile_request).await;
        profile_response.assert_status(StatusCode::OK);
        assert_eq!(profile_response.json()["sub"], "u1");
        assert_eq!(profile_response.json()["email"], "u1@ex");
    }

    #[tokio::test]
    async fn test_prompt_none_without_session_is_login_required() {
        let fixture = TestFixture::new().await;
        fixture.mount_default_portal(false, false).await;

        let response = fixture
            .get(&format!("{AUTHORIZE_URI}&prompt=none"))
            .await;
        response.assert_status(StatusCode::SEE_OTHER);
        let location = response.location();
        assert!(
            location.contains("error=login_required"),
            "location: {location}"
        );
    }

    #[tokio::test]
    async fn test_unknown_scope_is_invalid_scope() {
        let fixture = TestFixture::new().await;
        fixture.mount_default_portal(false, false).await;

        let response = fixture
            .get(
                "/auth/dummy/api/api1/authorize?response_type=code&client_id=CID\
&redirect_uri=https%3A%2F%2Fc.example%2Fcb&scope=read%20delete",
            )
            .await;
        response.assert_status(StatusCode::SEE_OTHER);
        let location = response.location();
        assert!(
            location.contains("error=invalid_scope"),
            "location: {location}"
        );
    }

    #[tokio::test]
    async fn test_unknown_client_renders_error_page() {
        let fixture = TestFixture::new().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions/NOPE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&fixture.portal_mock)
            .await;

        let response = fixture
            .get(
                "/auth/dummy/api/api1/authorize?response_type=code&client_id=NOPE\
&redirect_uri=https%3A%2F%2Fc.example%2Fcb",
            )
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        assert!(response.text().contains("invalid_client"));
    }

    #[tokio::test]
    async fn test_consent_deny_redirects_access_denied() {
        let fixture = TestFixture::new().await;
        fixture.mount_default_portal(false, false).await;
        fixture.mount_default_gateway().await;

        // No grant stored yet: consent is required
        Mock::given(method("GET"))
            .and(path("/grants/u1/applications/app1/apis/api1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&fixture.portal_mock)
            .await;

        let consent = fixture.get(AUTHORIZE_URI).await;
        consent.assert_status(StatusCode::OK);
        let html = consent.text();
        assert!(html.contains("read"), "consent page: {html}");
        let csrf = consent.csrf_token().expect("consent page has a form token");
        let cookies = consent.cookies();

        let denied = fixture
            .post_form(
                "/auth/dummy/grant",
                &format!("action=deny&csrf_token={csrf}"),
                Some(&cookies),
            )
            .await;
        denied.assert_status(StatusCode::SEE_OTHER);
        let location = denied.location();
        assert!(
            location.contains("error=access_denied"),
            "location: {location}"
        );
        assert!(location.starts_with("https://c.example/cb"));
    }

    #[tokio::test]
    async fn test_consent_post_without_token_is_forbidden() {
        let fixture = TestFixture::new().await;

        let response = fixture
            .post_form("/auth/dummy/grant", "action=deny&csrf_token=forged", None)
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_namespace_selection_flow() {
        let fixture = TestFixture::new().await;
        fixture.mount_default_gateway().await;

        // Trusted subscription, API with a namespace-requiring pool
        Mock::given(method("GET"))
            .and(path("/subscriptions/CID"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subscription": {
                    "api": "api1", "application": "app1",
                    "clientId": "CID", "clientSecret": "SECRET", "trusted": true
                },
                "application": {
                    "id": "app1", "confidential": false,
                    "redirectUri": "https://c.example/cb"
                }
            })))
            .mount(&fixture.portal_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/api1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "api1",
                "authMethods": ["dummy"],
                "registrationPool": "p",
                "settings": { "scopes": { "read": {} } }
            })))
            .mount(&fixture.portal_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u1", "email": "u1@ex", "validated": true, "groups": []
            })))
            .mount(&fixture.portal_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/pools/p"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "p", "requiresNamespace": true
            })))
            .mount(&fixture.portal_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/registrations/pools/p/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    { "poolId": "p", "userId": "u1", "namespace": "A", "name": "Ada" },
                    { "poolId": "p", "userId": "u1", "namespace": "B", "name": "Ada" }
                ]
            })))
            .mount(&fixture.portal_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/pools/p/namespaces/A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "namespace": "A"
            })))
            .mount(&fixture.portal_mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/api1/oauth2/authorize"))
            .and(body_partial_json(serde_json::json!({
                "authenticated_userid": "sub=u1;namespace=A"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "redirect_uri": "https://c.example/cb?code=NSCODE"
            })))
            .expect(1)
            .mount(&fixture.gateway_mock)
            .await;

        // Without a namespace parameter the selection page renders
        let select = fixture.get(AUTHORIZE_URI).await;
        select.assert_status(StatusCode::OK);
        let html = select.text();
        assert!(html.contains("selectnamespace"), "page: {html}");
        assert!(html.contains(">A<") && html.contains(">B<"), "page: {html}");
        let csrf = select.csrf_token().expect("selection page has a form token");
        let cookies = select.cookies();

        // Picking namespace A completes the flow
        let done = fixture
            .post_form(
                "/auth/dummy/selectnamespace",
                &format!("namespace=A&csrf_token={csrf}"),
                Some(&cookies),
            )
            .await;
        done.assert_status(StatusCode::SEE_OTHER);
        let location = done.location();
        assert!(location.contains("code=NSCODE"), "location: {location}");
        assert!(location.contains("namespace=A"), "location: {location}");
        fixture.gateway_mock.verify().await;
    }
}
