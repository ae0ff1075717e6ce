//! Top-level dispatcher: mounts one OAuth2 router per configured auth
//! method under `{base_path}/{authMethodId}`, plus the health and
//! OpenAPI endpoints.

pub mod grants;
pub mod health;
pub mod oauth;

use crate::idp::create_identity_provider;
use crate::state::{AppState, MethodState};
use axum::Router;
use log::info;
use std::sync::Arc;

/// Combine all routes into a single router. Fails when a configured and
/// enabled auth method cannot be instantiated.
pub(super) fn router(state: &AppState) -> Result<Router<AppState>, String> {
    let mut router = Router::new()
        .merge(health::router())
        .merge(crate::openapi::router());

    let base_path = state.config.base_path.trim_end_matches('/').to_string();
    for method in state.globals.enabled_auth_methods() {
        let idp = create_identity_provider(method, &state.portal)?;
        let method_state = MethodState::new(state.clone(), Arc::new(method.clone()), idp);
        let endpoints = method_state
            .idp
            .endpoints(&state.globals.external_url, &method.name);
        info!(
            "Mounting auth method {} ({:?}); authorize endpoint {}",
            method.name, method.kind, endpoints.authorize_endpoint
        );
        router = router.nest_service(
            &format!("{base_path}/{}", method.name),
            oauth::router(method_state),
        );
    }

    Ok(router)
}
