//! Test fixture: the full application router wired against wiremock
//! stand-ins for the portal API and the gateway.

use crate::config::Globals;
use crate::create_app;
use crate::state::AppState;
use axum::body::Body;
use axum::Router;
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use log::LevelFilter;
use serde_json::Value;
use tower::ServiceExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Test environment with mocked collaborators.
///
/// The fixture keeps the shared `AppState`, so tests can reach the
/// profile and session stores directly, and both mock servers, so tests
/// can mount expectations per scenario.
pub struct TestFixture {
    pub app: Router,
    pub state: AppState,
    pub portal_mock: MockServer,
    pub gateway_mock: MockServer,
}

impl TestFixture {
    pub async fn new() -> Self {
        let _ = env_logger::builder()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();

        let portal_mock = MockServer::start().await;
        let gateway_mock = MockServer::start().await;

        let config = crate::config::AuthServerConfig::for_test();
        let globals = Globals::for_test(
            &portal_mock.uri(),
            &gateway_mock.uri(),
            &gateway_mock.uri(),
        );
        let state = AppState::for_testing(&config, &globals);
        let app = create_app(state.clone())
            .await
            .expect("Failed to create test application");

        Self {
            app,
            state,
            portal_mock,
            gateway_mock,
        }
    }

    /// Mount the standard portal mocks of the happy-path scenario: API
    /// `api1` with scopes read/write, application `app1` with client id
    /// `CID`, and user `u1`
    pub async fn mount_default_portal(&self, trusted: bool, confidential: bool) {
        Mock::given(method("GET"))
            .and(path("/subscriptions/CID"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subscription": {
                    "api": "api1",
                    "application": "app1",
                    "clientId": "CID",
                    "clientSecret": "SECRET",
                    "trusted": trusted
                },
                "application": {
                    "id": "app1",
                    "name": "Test Application",
                    "confidential": confidential,
                    "redirectUri": "https://c.example/cb"
                }
            })))
            .mount(&self.portal_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/api1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "api1",
                "authMethods": ["local", "dummy"],
                "settings": {
                    "scopes": { "read": {}, "write": {} }
                }
            })))
            .mount(&self.portal_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u1",
                "email": "u1@ex",
                "validated": true,
                "groups": []
            })))
            .mount(&self.portal_mock)
            .await;
    }

    /// Mount the standard gateway mocks for `api1`: an oauth2 plugin
    /// with all grants enabled, and the API routed at `/api1`
    pub async fn mount_default_gateway(&self) {
        Mock::given(method("GET"))
            .and(path("/apis/api1/plugins"))
            .and(query_param("name", "oauth2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [ { "name": "oauth2", "config": {
                    "provision_key": "PK",
                    "enable_authorization_code": true,
                    "enable_implicit_grant": true,
                    "enable_client_credentials": true,
                    "enable_password_grant": true
                } } ]
            })))
            .mount(&self.gateway_mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/api1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uris": ["/api1"]
            })))
            .mount(&self.gateway_mock)
            .await;
    }

    pub fn request_builder(&self, method: Method, uri: impl AsRef<str>) -> http::request::Builder {
        Request::builder().method(method).uri(uri.as_ref())
    }

    pub async fn get(&self, uri: impl AsRef<str>) -> TestResponse {
        let request = self
            .request_builder(Method::GET, uri)
            .body(Body::empty())
            .expect("Failed to build request");
        self.send(request).await
    }

    /// GET with the session cookies captured from a previous response
    pub async fn get_with_cookies(&self, uri: impl AsRef<str>, cookies: &str) -> TestResponse {
        let request = self
            .request_builder(Method::GET, uri)
            .header("Cookie", cookies)
            .body(Body::empty())
            .expect("Failed to build request");
        self.send(request).await
    }

    /// POST an urlencoded form, optionally with session cookies
    pub async fn post_form(
        &self,
        uri: impl AsRef<str>,
        form: &str,
        cookies: Option<&str>,
    ) -> TestResponse {
        let mut builder = self
            .request_builder(Method::POST, uri)
            .header("Content-Type", "application/x-www-form-urlencoded");
        if let Some(cookies) = cookies {
            builder = builder.header("Cookie", cookies);
        }
        let request = builder
            .body(Body::from(form.to_string()))
            .expect("Failed to build request");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read response body")
            .to_bytes();

        TestResponse {
            status,
            headers,
            body: body.to_vec(),
        }
    }
}

/// Response of a test request
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: http::HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn assert_status(&self, expected: StatusCode) -> &Self {
        assert_eq!(
            self.status,
            expected,
            "Expected status {} but got {} with body: {}",
            expected,
            self.status,
            self.text()
        );
        self
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// The Location header of a redirect
    pub fn location(&self) -> String {
        self.headers
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    /// The session cookies set by this response, ready for a Cookie
    /// header
    pub fn cookies(&self) -> String {
        self.headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Pull the single-use form token out of a rendered page
    pub fn csrf_token(&self) -> Option<String> {
        extract_form_value(&self.text(), "csrf_token")
    }

    /// Pull the registration nonce out of a rendered page
    pub fn nonce(&self) -> Option<String> {
        extract_form_value(&self.text(), "nonce")
    }
}

fn extract_form_value(html: &str, field: &str) -> Option<String> {
    let marker = format!(r#"name="{field}" value=""#);
    let start = html.find(&marker)? + marker.len();
    let end = html[start..].find('"')? + start;
    Some(html[start..end].to_string())
}
