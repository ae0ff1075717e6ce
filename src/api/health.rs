//! Liveness endpoint reporting the health of the shared store.

use crate::cache::CacheBackend;
use crate::openapi::HEALTH_TAG;
use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;
use log::debug;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Serialize)]
struct ComponentStatus {
    status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: HealthStatus,
    cache: ComponentStatus,
}

/// GET /health
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is not healthy")
    ),
    tag = HEALTH_TAG
)]
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let cache = match state.cache.health_check().await {
        Ok(()) => ComponentStatus {
            status: HealthStatus::Ok,
            error: None,
        },
        Err(e) => ComponentStatus {
            status: HealthStatus::Error,
            error: Some(e),
        },
    };
    let healthy = matches!(cache.status, HealthStatus::Ok);
    if healthy {
        debug!("Health check passed");
    } else {
        log::info!("Health check failed: {:?}", cache.error);
    }
    let response = HealthResponse {
        status: if healthy {
            HealthStatus::Ok
        } else {
            HealthStatus::Error
        },
        cache,
    };
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
