use utoipa::OpenApi;

pub(crate) const OAUTH2_TAG: &str = "OAuth2";
pub(crate) const HEALTH_TAG: &str = "Health";

#[derive(OpenApi)]
#[openapi(
    components(
        schemas(
            crate::api::oauth::models::TokenRequestBody,
            crate::api::oauth::models::TokenResponse,
            crate::api::oauth::models::OAuthErrorBody,
            crate::session::OidcProfile,
        )
    ),
    tags(
        (name = "OAuth2", description = "OAuth2 authorize and token endpoints"),
        (name = "Health", description = "Health check endpoints")
    ),
    info(
        title = "Authorization Server API",
        description = "OAuth2 authorization server of the API management portal",
        version = "1.0.0"
    )
)]
pub(crate) struct ApiDoc;

/// Serves the generated OpenAPI document
pub(crate) fn router() -> axum::Router<crate::state::AppState> {
    use axum::{routing::get, Json, Router};
    Router::new().route(
        "/openapi.json",
        get(|| async { Json(ApiDoc::openapi()) }),
    )
}
