//! Verification flows: email confirmation, password reset via a
//! verification link, re-requesting a verification email, and the
//! forgot-password entry. The email-based entries deliberately answer
//! identically whether or not the address is known.

use super::error::{FlowError, OAuthErrorKind};
use super::flow::method_base;
use super::models::{EmailForm, VerifyForm};
use super::templates;
use crate::portal::models::{UserPatch, Verification, VerificationType};
use crate::session::SessionHandle;
use crate::state::MethodState;
use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Response};
use axum::Form;
use axum_extra::extract::SignedCookieJar;
use log::{info, warn};

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

/// GET /verify/:id — render the verification form for a pending
/// verification; unknown ids answer slowly
pub async fn verify_get(
    State(state): State<MethodState>,
    Path(verification_id): Path<String>,
    jar: SignedCookieJar,
) -> Response {
    let mut session = match load_session(&state, &jar).await {
        Ok(session) => session,
        Err(e) => return e.render().await,
    };
    let result = verify_get_inner(&state, &mut session, &verification_id).await;
    super::finish(&state, jar, session, result).await
}

async fn verify_get_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    verification_id: &str,
) -> Result<Response, FlowError> {
    let verification = state
        .app
        .portal
        .get_verification(verification_id)
        .await
        .map_err(|e| FlowError::from_portal(e, super::error::ErrorRender::Page))?;
    let Some(verification) = verification else {
        return Err(FlowError::page(
            OAuthErrorKind::InvalidRequest,
            "Invalid verification id",
        )
        .with_status(http::StatusCode::NOT_FOUND)
        .delayed());
    };

    let csrf = session.data.issue_csrf_token();
    let html = templates::verify_page(
        &format!("{}/verify", method_base(state)),
        &csrf,
        verification.id.as_deref().unwrap_or(verification_id),
        verification.kind == VerificationType::LostPassword,
    );
    Ok(Html(html).into_response())
}

/// POST /verify — complete an email confirmation or a password reset
pub async fn verify_post(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
    Form(form): Form<VerifyForm>,
) -> Response {
    let mut session = match load_session(&state, &jar).await {
        Ok(session) => session,
        Err(e) => return e.render().await,
    };
    let result = verify_post_inner(&state, &mut session, form).await;
    super::finish(&state, jar, session, result).await
}

async fn verify_post_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    form: VerifyForm,
) -> Result<Response, FlowError> {
    if !session.data.consume_csrf_token(&form.csrf_token) {
        return Err(FlowError::page(
            OAuthErrorKind::AccessDenied,
            "The form token is missing or no longer valid",
        )
        .delayed());
    }

    let verification = state
        .app
        .portal
        .get_verification(&form.id)
        .await
        .map_err(|e| FlowError::from_portal(e, super::error::ErrorRender::Page))?
        .ok_or_else(|| {
            FlowError::page(OAuthErrorKind::InvalidRequest, "Invalid verification id")
                .with_status(http::StatusCode::NOT_FOUND)
                .delayed()
        })?;
    let user_id = verification.user_id.clone().ok_or_else(|| {
        FlowError::page(
            OAuthErrorKind::ServerError,
            "The verification is not bound to a user",
        )
    })?;

    let message = match verification.kind {
        VerificationType::Email => {
            state
                .app
                .portal
                .patch_user(
                    &user_id,
                    &UserPatch {
                        password: None,
                        validated: Some(true),
                    },
                )
                .await
                .map_err(|e| FlowError::from_portal(e, super::error::ErrorRender::Page))?;
            info!("Email verified for user {user_id}");
            "Your email address has been verified."
        }
        VerificationType::LostPassword => {
            let password = form
                .password
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    FlowError::page(OAuthErrorKind::InvalidRequest, "A new password is required")
                })?;
            state
                .app
                .portal
                .patch_user(
                    &user_id,
                    &UserPatch {
                        password: Some(password.to_string()),
                        validated: None,
                    },
                )
                .await
                .map_err(|e| FlowError::from_portal(e, super::error::ErrorRender::Page))?;
            info!("Password reset completed for user {user_id}");
            "Your password has been changed. You can now sign in with it."
        }
    };

    // Used verifications are retired; failing to do so is not fatal
    if let Err(e) = state.app.portal.delete_verification(&form.id).await {
        warn!("Failed to delete verification {}: {e}", form.id);
    }

    Ok(Html(templates::verify_done_page(message)).into_response())
}

/// GET /verifyemail — form to re-request a verification email
pub async fn verify_email_get(State(state): State<MethodState>, jar: SignedCookieJar) -> Response {
    email_form_page(
        &state,
        jar,
        "Verify your email",
        "Enter your email address and we will send you a new verification link.",
    )
    .await
}

/// POST /verifyemail
pub async fn verify_email_post(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
    Form(form): Form<EmailForm>,
) -> Response {
    email_form_post(&state, jar, form, VerificationType::Email).await
}

/// GET /forgotpassword — form to request a password reset link
pub async fn forgot_password_get(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
) -> Response {
    email_form_page(
        &state,
        jar,
        "Forgot your password?",
        "Enter your email address and we will send you a link to reset it.",
    )
    .await
}

/// POST /forgotpassword
pub async fn forgot_password_post(
    State(state): State<MethodState>,
    jar: SignedCookieJar,
    Form(form): Form<EmailForm>,
) -> Response {
    email_form_post(&state, jar, form, VerificationType::LostPassword).await
}

async fn email_form_page(
    state: &MethodState,
    jar: SignedCookieJar,
    title: &str,
    hint: &str,
) -> Response {
    let mut session = match load_session(state, &jar).await {
        Ok(session) => session,
        Err(e) => return e.render().await,
    };
    let csrf = session.data.issue_csrf_token();
    let action = match title.starts_with("Verify") {
        true => format!("{}/verifyemail", method_base(state)),
        false => format!("{}/forgotpassword", method_base(state)),
    };
    let html = templates::email_form_page(title, hint, &action, &csrf);
    super::finish(state, jar, session, Ok(Html(html).into_response())).await
}

/// Shared POST behavior: the response never reveals whether the email
/// exists; a verification is created only when it does
async fn email_form_post(
    state: &MethodState,
    jar: SignedCookieJar,
    form: EmailForm,
    kind: VerificationType,
) -> Response {
    let mut session = match load_session(state, &jar).await {
        Ok(session) => session,
        Err(e) => return e.render().await,
    };
    let result = email_form_post_inner(state, &mut session, form, kind).await;
    super::finish(state, jar, session, result).await
}

async fn email_form_post_inner(
    state: &MethodState,
    session: &mut SessionHandle,
    form: EmailForm,
    kind: VerificationType,
) -> Result<Response, FlowError> {
    if !session.data.consume_csrf_token(&form.csrf_token) {
        return Err(FlowError::page(
            OAuthErrorKind::AccessDenied,
            "The form token is missing or no longer valid",
        )
        .delayed());
    }

    if !form.email.is_empty() {
        match state.app.portal.find_users_by_email(&form.email).await {
            Ok(users) => {
                if let Some(user) = users.first() {
                    let verification = Verification {
                        id: None,
                        kind,
                        email: form.email.clone(),
                        user_id: Some(user.id.clone()),
                        link: Some(format!(
                            "{}/verify/{{id}}",
                            method_base(state)
                        )),
                    };
                    if let Err(e) = state.app.portal.create_verification(&verification).await {
                        // Still answer neutrally; the error only shows in logs
                        warn!("Failed to create verification for {}: {e}", form.email);
                    }
                } else {
                    info!("Verification requested for unknown email address");
                }
            }
            Err(e) => {
                warn!("User lookup failed for verification request: {e}");
            }
        }
    }

    Ok(Html(templates::email_sent_page()).into_response())
}
