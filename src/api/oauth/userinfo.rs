//! OIDC-style userinfo endpoint: resolves a bearer token to the profile
//! captured when the token was issued.

use crate::openapi::OAUTH2_TAG;
use crate::session::OidcProfile;
use crate::state::MethodState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::AUTHORIZATION;
use http::{HeaderMap, StatusCode};
use log::debug;
use serde_json::json;

/// GET /profile
#[utoipa::path(
    get,
    path = "/profile",
    responses(
        (status = 200, description = "The profile bound to the bearer token", body = OidcProfile),
        (status = 401, description = "Missing, unknown or expired token")
    ),
    tag = OAUTH2_TAG
)]
pub async fn profile_get(State(state): State<MethodState>, headers: HeaderMap) -> Response {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")));

    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return invalid_token("A bearer token is required");
    };

    match state.app.profiles.retrieve(token).await {
        Ok(Some(entry)) => {
            debug!("Profile lookup succeeded for sub {}", entry.profile.sub);
            Json(entry.profile).into_response()
        }
        Ok(None) => invalid_token("The token is not known or has expired"),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "server_error",
                "error_description": format!("Profile store is unavailable: {e}"),
            })),
        )
            .into_response(),
    }
}

fn invalid_token(description: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            http::header::WWW_AUTHENTICATE,
            r#"Bearer error="invalid_token""#,
        )],
        Json(json!({
            "error": "invalid_token",
            "error_description": description,
        })),
    )
        .into_response()
}
