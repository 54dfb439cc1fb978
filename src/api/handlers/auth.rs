//! Core authentication endpoints.
//!
//! Business denials (wrong password, expired link, weak password) come back
//! as HTTP 200 with `{success:false, error, message}` so clients render them
//! inline; 401 is reserved for requests with no usable session and 5xx for
//! infrastructure failures.

use axum::{
    Extension, Json,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::error;

use super::{clear_session_cookie, extract_session_token, session_context, session_cookie};
use crate::api::ApiConfig;
use crate::api::types::{
    AuthResponse, EmailRequest, LoginRequest, RegisterRequest, ResetConfirmRequest, TokenRequest,
    UpdatePasswordRequest,
};
use crate::auth::{
    AuthService, AuthSuccess, Credentials, LoginOutcome, MagicLinkOutcome, PasswordResetOutcome,
    RegisterOutcome, UpdatePasswordOutcome,
};
use crate::error::ServiceError;

/// 200 + session cookie + the authenticated body.
pub(super) fn authenticated_response(success: &AuthSuccess, secure: bool) -> Response {
    let mut response = Json(AuthResponse::authenticated(success)).into_response();
    match session_cookie(&success.session, &success.token, secure) {
        Ok(cookie) => {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    response
}

pub(super) fn login_outcome_response(outcome: LoginOutcome, secure: bool) -> Response {
    match outcome {
        LoginOutcome::Authenticated(success) => authenticated_response(&success, secure),
        LoginOutcome::MfaRequired {
            access_token,
            methods,
        } => Json(AuthResponse::mfa_required(access_token, methods)).into_response(),
        LoginOutcome::Denied(denial) => Json(AuthResponse::denied(&denial)).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login outcome: authenticated, MFA required, or denied", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    config: Extension<ApiConfig>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ServiceError> {
    let context = session_context(&headers);
    let credentials = Credentials {
        email: body.email,
        password: SecretString::from(body.password),
    };
    let outcome = auth.login(&credentials, &context).await?;
    Ok(login_outcome_response(outcome, config.production))
}

#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = AuthResponse),
        (status = 200, description = "Registration denied", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn register(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    config: Extension<ApiConfig>,
    Json(body): Json<RegisterRequest>,
) -> Result<Response, ServiceError> {
    let context = session_context(&headers);
    let password = SecretString::from(body.password);
    match auth.register(&body.email, &password, &context).await? {
        RegisterOutcome::Registered { user, login } => {
            let mut response = match login {
                Some(success) => authenticated_response(&success, config.production),
                None => {
                    let mut body = AuthResponse::ok();
                    body.user = Some((&user).into());
                    Json(body).into_response()
                }
            };
            *response.status_mut() = StatusCode::CREATED;
            Ok(response)
        }
        RegisterOutcome::Denied(denial) => Ok(Json(AuthResponse::denied(&denial)).into_response()),
    }
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Session cleared", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    config: Extension<ApiConfig>,
) -> Result<Response, ServiceError> {
    if let Some(token) = extract_session_token(&headers) {
        auth.logout(&token).await?;
    }
    // Always clear the cookie, even when no session resolved.
    let mut response = Json(AuthResponse::ok()).into_response();
    match clear_session_cookie(config.production) {
        Ok(cookie) => {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build clearing cookie: {err}"),
    }
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/auth/refresh",
    responses(
        (status = 200, description = "Whether the session was extended", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
) -> Result<Response, ServiceError> {
    let Some(token) = extract_session_token(&headers) else {
        return Ok(Json(AuthResponse::failure("no_session", "Sign in first")).into_response());
    };
    if auth.refresh_token(&token).await? {
        Ok(Json(AuthResponse::ok()).into_response())
    } else {
        Ok(Json(AuthResponse::failure(
            "session_expired",
            "Session can no longer be extended, sign in again",
        ))
        .into_response())
    }
}

#[utoipa::path(
    post,
    path = "/auth/magic-link",
    request_body = EmailRequest,
    responses(
        (status = 202, description = "Link sent if the address is known", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn send_magic_link(
    auth: Extension<Arc<AuthService>>,
    Json(body): Json<EmailRequest>,
) -> Result<Response, ServiceError> {
    auth.send_magic_link(&body.email).await?;
    Ok((StatusCode::ACCEPTED, Json(AuthResponse::ok())).into_response())
}

#[utoipa::path(
    post,
    path = "/auth/magic-link/verify",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Authenticated or link expired", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn verify_magic_link(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    config: Extension<ApiConfig>,
    Json(body): Json<TokenRequest>,
) -> Result<Response, ServiceError> {
    let context = session_context(&headers);
    match auth.verify_magic_link(&body.token, &context).await? {
        MagicLinkOutcome::Authenticated(success) => {
            Ok(authenticated_response(&success, config.production))
        }
        MagicLinkOutcome::LinkExpired => Ok(Json(AuthResponse::failure(
            "link_expired",
            "This link has expired, request a new one",
        ))
        .into_response()),
    }
}

#[utoipa::path(
    post,
    path = "/auth/verify-email",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Email verified or link expired", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn verify_email(
    auth: Extension<Arc<AuthService>>,
    Json(body): Json<TokenRequest>,
) -> Result<Response, ServiceError> {
    if auth.verify_email(&body.token).await? {
        Ok(Json(AuthResponse::ok()).into_response())
    } else {
        Ok(Json(AuthResponse::failure(
            "link_expired",
            "This link has expired, request a new one",
        ))
        .into_response())
    }
}

#[utoipa::path(
    post,
    path = "/auth/verify-email/resend",
    request_body = EmailRequest,
    responses(
        (status = 202, description = "Link sent if the address is known and unverified", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn resend_verification(
    auth: Extension<Arc<AuthService>>,
    Json(body): Json<EmailRequest>,
) -> Result<Response, ServiceError> {
    auth.resend_verification_email(&body.email).await?;
    Ok((StatusCode::ACCEPTED, Json(AuthResponse::ok())).into_response())
}

#[utoipa::path(
    post,
    path = "/auth/password-reset",
    request_body = EmailRequest,
    responses(
        (status = 202, description = "Reset link sent if the address is known", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn request_password_reset(
    auth: Extension<Arc<AuthService>>,
    Json(body): Json<EmailRequest>,
) -> Result<Response, ServiceError> {
    auth.reset_password(&body.email).await?;
    Ok((StatusCode::ACCEPTED, Json(AuthResponse::ok())).into_response())
}

#[utoipa::path(
    post,
    path = "/auth/password-reset/confirm",
    request_body = ResetConfirmRequest,
    responses(
        (status = 200, description = "Password replaced and signed in, or denied", body = AuthResponse)
    ),
    tag = "auth"
)]
pub async fn confirm_password_reset(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    config: Extension<ApiConfig>,
    Json(body): Json<ResetConfirmRequest>,
) -> Result<Response, ServiceError> {
    let context = session_context(&headers);
    let new_password = SecretString::from(body.new_password);
    match auth
        .update_password_with_token(&body.token, &new_password, &context)
        .await?
    {
        PasswordResetOutcome::Authenticated(success) => {
            Ok(authenticated_response(&success, config.production))
        }
        PasswordResetOutcome::LinkExpired => Ok(Json(AuthResponse::failure(
            "link_expired",
            "This link has expired, request a new one",
        ))
        .into_response()),
        PasswordResetOutcome::Denied(denial) => {
            Ok(Json(AuthResponse::denied(&denial)).into_response())
        }
    }
}

#[utoipa::path(
    post,
    path = "/auth/password",
    request_body = UpdatePasswordRequest,
    responses(
        (status = 200, description = "Password updated or denied", body = AuthResponse),
        (status = 401, description = "No active session")
    ),
    tag = "auth"
)]
pub async fn update_password(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    Json(body): Json<UpdatePasswordRequest>,
) -> Result<Response, ServiceError> {
    let Some((user, session)) = extract_principal(&headers, &auth).await? else {
        return Err(ServiceError::authentication("Sign in first"));
    };
    let old_password = SecretString::from(body.old_password);
    let new_password = SecretString::from(body.new_password);
    match auth
        .update_password(&user, &session, &old_password, &new_password)
        .await?
    {
        UpdatePasswordOutcome::Updated { .. } => Ok(Json(AuthResponse::ok()).into_response()),
        UpdatePasswordOutcome::Denied(denial) => {
            Ok(Json(AuthResponse::denied(&denial)).into_response())
        }
    }
}

pub(super) async fn extract_principal(
    headers: &HeaderMap,
    auth: &AuthService,
) -> Result<Option<(crate::store::UserRecord, crate::store::SessionRow)>, ServiceError> {
    let Some(token) = extract_session_token(headers) else {
        return Ok(None);
    };
    auth.authenticate(&token).await
}
