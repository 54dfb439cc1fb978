//! MFA challenge endpoints for the pending-login flow.

use axum::{Extension, Json, http::HeaderMap, response::{IntoResponse, Response}};
use std::sync::Arc;

use super::{auth::authenticated_response, session_context};
use crate::api::ApiConfig;
use crate::api::types::{AuthResponse, MfaCheckRequest, MfaResendRequest, MfaVerifyRequest};
use crate::auth::{AuthService, MfaLoginOutcome};
use crate::error::ServiceError;
use crate::mfa::{MfaCheckOutcome, MfaResendOutcome};
use crate::policy::MfaMethod;

#[utoipa::path(
    post,
    path = "/auth/mfa/check",
    request_body = MfaCheckRequest,
    responses(
        (status = 200, description = "Challenge ready or token invalid", body = AuthResponse)
    ),
    tag = "mfa"
)]
pub async fn check(
    auth: Extension<Arc<AuthService>>,
    Json(body): Json<MfaCheckRequest>,
) -> Result<Response, ServiceError> {
    match auth
        .check_mfa_requirements(&body.access_token, body.preferred_method)
        .await?
    {
        MfaCheckOutcome::Ready {
            method,
            masked_target,
        } => {
            let mut response = AuthResponse::ok();
            response.mfa_required = Some(true);
            response.available_methods = Some(vec![method]);
            response.message = masked_target;
            Ok(Json(response).into_response())
        }
        MfaCheckOutcome::InvalidToken => Ok(Json(AuthResponse::failure(
            "mfa_expired",
            "This challenge has expired, sign in again",
        ))
        .into_response()),
    }
}

#[utoipa::path(
    post,
    path = "/auth/mfa/verify",
    request_body = MfaVerifyRequest,
    responses(
        (status = 200, description = "Authenticated or denied", body = AuthResponse)
    ),
    tag = "mfa"
)]
pub async fn verify(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    config: Extension<ApiConfig>,
    Json(body): Json<MfaVerifyRequest>,
) -> Result<Response, ServiceError> {
    let context = session_context(&headers);
    match auth
        .verify_mfa_code(&body.access_token, &body.code, body.remember_device, &context)
        .await?
    {
        MfaLoginOutcome::Authenticated { success, .. } => {
            Ok(authenticated_response(&success, config.production))
        }
        MfaLoginOutcome::Denied(denial) => Ok(Json(AuthResponse::denied(&denial)).into_response()),
    }
}

#[utoipa::path(
    post,
    path = "/auth/mfa/resend",
    request_body = MfaResendRequest,
    responses(
        (status = 200, description = "Code re-sent, throttled, or unavailable", body = AuthResponse)
    ),
    tag = "mfa"
)]
pub async fn resend(
    auth: Extension<Arc<AuthService>>,
    Json(body): Json<MfaResendRequest>,
) -> Result<Response, ServiceError> {
    let outcome = match body.method {
        MfaMethod::Email => auth.resend_mfa_email_code(&body.access_token).await?,
        MfaMethod::Sms => auth.resend_mfa_sms_code(&body.access_token).await?,
        MfaMethod::Totp => MfaResendOutcome::MethodNotAvailable,
    };
    let response = match outcome {
        MfaResendOutcome::Sent { masked_target } => {
            let mut response = AuthResponse::ok();
            response.message = Some(masked_target);
            response
        }
        MfaResendOutcome::Throttled => AuthResponse::failure(
            "resend_throttled",
            "A code was sent recently, wait before requesting another",
        ),
        MfaResendOutcome::MethodNotAvailable => AuthResponse::failure(
            "method_not_available",
            "That delivery method is not available for this account",
        ),
        MfaResendOutcome::InvalidToken => AuthResponse::failure(
            "mfa_expired",
            "This challenge has expired, sign in again",
        ),
    };
    Ok(Json(response).into_response())
}
