//! OAuth2 flow errors and their three renderings: JSON for the token
//! flow, a redirect with `error`/`error_description` query parameters
//! when the authorize flow knows a redirect URI, and an HTML error page
//! otherwise.

use super::models::OAuthErrorBody;
use super::templates;
use crate::gateway::GatewayError;
use crate::portal::PortalError;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use http::StatusCode;
use log::warn;
use std::time::Duration;

/// The OAuth2 error kinds this server emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidClient,
    InvalidScope,
    UnsupportedGrantType,
    UnsupportedResponseType,
    UnauthorizedClient,
    AccessDenied,
    LoginRequired,
    ServerError,
}

impl OAuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidScope => "invalid_scope",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::LoginRequired => "login_required",
            Self::ServerError => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest
            | Self::InvalidScope
            | Self::UnsupportedGrantType
            | Self::UnsupportedResponseType => StatusCode::BAD_REQUEST,
            Self::InvalidClient | Self::LoginRequired => StatusCode::UNAUTHORIZED,
            Self::UnauthorizedClient | Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn from_wire(error: &str) -> Self {
        match error {
            "invalid_request" => Self::InvalidRequest,
            "invalid_client" => Self::InvalidClient,
            "invalid_scope" => Self::InvalidScope,
            "unsupported_grant_type" => Self::UnsupportedGrantType,
            "unsupported_response_type" => Self::UnsupportedResponseType,
            "unauthorized_client" => Self::UnauthorizedClient,
            "access_denied" => Self::AccessDenied,
            "login_required" => Self::LoginRequired,
            _ => Self::ServerError,
        }
    }
}

/// How the error reaches the user agent
#[derive(Debug, Clone)]
pub enum ErrorRender {
    /// JSON body, token flow
    Json,
    /// 302 back to the client with error query parameters
    Redirect {
        redirect_uri: String,
        state: Option<String>,
    },
    /// HTML error page
    Page,
}

/// An OAuth2 flow failure with its rendering decision
#[derive(Debug)]
pub struct FlowError {
    pub kind: OAuthErrorKind,
    pub description: String,
    pub render: ErrorRender,
    /// Preserve an upstream status instead of the kind's default
    pub status_override: Option<StatusCode>,
    /// Authentication failures respond no earlier than 500 ms
    pub delayed: bool,
}

impl FlowError {
    pub fn new(kind: OAuthErrorKind, description: impl ToString, render: ErrorRender) -> Self {
        Self {
            kind,
            description: description.to_string(),
            render,
            status_override: None,
            delayed: false,
        }
    }

    pub fn json(kind: OAuthErrorKind, description: impl ToString) -> Self {
        Self::new(kind, description, ErrorRender::Json)
    }

    pub fn page(kind: OAuthErrorKind, description: impl ToString) -> Self {
        Self::new(kind, description, ErrorRender::Page)
    }

    pub fn redirect(
        kind: OAuthErrorKind,
        description: impl ToString,
        redirect_uri: impl ToString,
        state: Option<String>,
    ) -> Self {
        Self::new(
            kind,
            description,
            ErrorRender::Redirect {
                redirect_uri: redirect_uri.to_string(),
                state,
            },
        )
    }

    /// Delay the response by at least 500 ms before it is written
    pub fn delayed(mut self) -> Self {
        self.delayed = true;
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status_override = Some(status);
        self
    }

    /// Map a gateway failure; the gateway's own OAuth2 error body and
    /// status win when present
    pub fn from_gateway(err: GatewayError, render: ErrorRender) -> Self {
        match err {
            GatewayError::OAuth {
                status,
                error,
                description,
            } => {
                let mut flow_error =
                    Self::new(OAuthErrorKind::from_wire(&error), description, render);
                if status.as_u16() >= 400 {
                    flow_error.status_override = Some(status);
                }
                flow_error
            }
            GatewayError::GrantDisabled(grant) => Self::new(
                OAuthErrorKind::UnauthorizedClient,
                format!("The {grant} grant is not enabled for this API"),
                render,
            ),
            GatewayError::Config { .. } => {
                Self::new(OAuthErrorKind::ServerError, err.to_string(), render)
            }
            GatewayError::Http(_) => Self::new(
                OAuthErrorKind::ServerError,
                "Gateway is not reachable",
                render,
            ),
        }
    }

    /// Map a portal failure that was not handled more specifically
    pub fn from_portal(err: PortalError, render: ErrorRender) -> Self {
        let status = err.upstream_status();
        let mut flow_error = match err {
            PortalError::DuplicateEmail => {
                Self::new(OAuthErrorKind::InvalidRequest, err.to_string(), render)
            }
            PortalError::InvalidCredentials => {
                Self::new(OAuthErrorKind::InvalidClient, err.to_string(), render)
            }
            other => Self::new(
                OAuthErrorKind::ServerError,
                format!("Portal API request failed: {other}"),
                render,
            ),
        };
        if let Some(status) = status {
            if status.as_u16() >= 400 && flow_error.kind == OAuthErrorKind::ServerError {
                flow_error.status_override = Some(status);
            }
        }
        flow_error
    }

    pub fn status(&self) -> StatusCode {
        self.status_override.unwrap_or_else(|| self.kind.status())
    }

    /// Build the response, honoring the delay
    pub async fn render(self) -> Response {
        if self.delayed {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        warn!(
            "OAuth2 flow error: {} ({}): {}",
            self.kind.as_str(),
            self.status(),
            self.description
        );
        match &self.render {
            ErrorRender::Json => {
                let body = OAuthErrorBody {
                    error: self.kind.as_str().to_string(),
                    error_description: Some(self.description.clone()),
                };
                (self.status(), Json(body)).into_response()
            }
            ErrorRender::Redirect {
                redirect_uri,
                state,
            } => match url::Url::parse(redirect_uri) {
                Ok(mut url) => {
                    url.query_pairs_mut()
                        .append_pair("error", self.kind.as_str())
                        .append_pair("error_description", &self.description);
                    if let Some(state) = state {
                        url.query_pairs_mut().append_pair("state", state);
                    }
                    Redirect::to(url.as_str()).into_response()
                }
                Err(_) => (
                    self.status(),
                    Html(templates::error_page(
                        self.status(),
                        self.kind.as_str(),
                        &self.description,
                        None,
                    )),
                )
                    .into_response(),
            },
            ErrorRender::Page => (
                self.status(),
                Html(templates::error_page(
                    self.status(),
                    self.kind.as_str(),
                    &self.description,
                    None,
                )),
            )
                .into_response(),
        }
    }
}

impl IntoResponse for FlowError {
    fn into_response(self) -> Response {
        // Extractor rejections go through here; the delay only applies to
        // the explicit render path
        let body = OAuthErrorBody {
            error: self.kind.as_str().to_string(),
            error_description: Some(self.description.clone()),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Resolve a flow result into a response; errors render themselves
pub async fn respond(result: Result<Response, FlowError>) -> Response {
    match result {
        Ok(response) => response,
        Err(error) => error.render().await,
    }
}
