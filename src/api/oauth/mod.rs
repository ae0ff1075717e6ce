//! The OAuth2 router mounted once per configured auth method. All
//! endpoints live under `{base_path}/{authMethodId}`.

pub mod authorize;
pub mod consent;
pub mod error;
pub mod flow;
pub mod login;
pub mod models;
pub mod registration;
pub mod templates;
pub mod token;
pub mod userinfo;
pub mod verify;

use crate::config::DeploymentMode;
use crate::session::{session_cookie, SessionHandle, StoredError};
use crate::state::MethodState;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::SignedCookieJar;
use error::{respond, FlowError, OAuthErrorKind};
use log::error;

/// Build the router of one auth method; state is applied here so the
/// dispatcher can mount it under its path
pub fn router(state: MethodState) -> Router {
    Router::new()
        .route("/api/:api_id/authorize", get(authorize::authorize_get))
        .route("/api/:api_id/token", post(token::token_post))
        .route("/login", get(login::login_get).post(login::login_post))
        .route("/logout", get(login::logout_get))
        .route("/failure", get(login::failure_get))
        .route("/profile", get(userinfo::profile_get))
        .route("/register", post(registration::register_post))
        .route(
            "/selectnamespace",
            post(registration::select_namespace_post),
        )
        .route("/grant", post(consent::grant_post))
        .route("/verify/:id", get(verify::verify_get))
        .route("/verify", post(verify::verify_post))
        .route(
            "/verifyemail",
            get(verify::verify_email_get).post(verify::verify_email_post),
        )
        .route(
            "/forgotpassword",
            get(verify::forgot_password_get).post(verify::forgot_password_post),
        )
        .nest("/grants", crate::api::grants::router())
        .with_state(state)
}

/// Persist the session, set the session cookie, and turn the flow result
/// into a response. Every session-carrying handler funnels through here
/// so the store write always happens before the response is written.
pub(crate) async fn finish(
    state: &MethodState,
    jar: SignedCookieJar,
    mut session: SessionHandle,
    result: Result<Response, FlowError>,
) -> Response {
    if let Err(flow_error) = &result {
        session.data.last_error = Some(StoredError {
            message: flow_error.description.clone(),
            status: flow_error.status().as_u16(),
        });
    }
    if let Err(e) = state.app.sessions.save(&session).await {
        error!("Failed to persist session {}: {e}", session.sid);
        return FlowError::page(
            OAuthErrorKind::ServerError,
            "Session storage is unavailable",
        )
        .render()
        .await;
    }
    let secure = state.app.config.mode == DeploymentMode::Production;
    let cookie = session_cookie(&session.sid, secure, state.app.config.session_ttl_secs());
    let jar = jar.add(cookie);
    (jar, respond(result).await).into_response()
}
