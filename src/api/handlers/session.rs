//! Session listing and bulk revocation for the authenticated caller.

use axum::{
    Extension, Json,
    http::{HeaderMap, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use super::{auth::extract_principal, clear_session_cookie};
use crate::api::ApiConfig;
use crate::api::types::{RevokeAllResponse, SessionBody, SessionsResponse};
use crate::auth::AuthService;
use crate::error::ServiceError;

#[utoipa::path(
    get,
    path = "/session",
    responses(
        (status = 200, description = "Active sessions, newest first", body = SessionsResponse),
        (status = 401, description = "No active session")
    ),
    tag = "session"
)]
pub async fn list(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
) -> Result<Response, ServiceError> {
    let Some((user, current)) = extract_principal(&headers, &auth).await? else {
        return Err(ServiceError::authentication("Sign in first"));
    };
    let sessions = auth
        .sessions()
        .list(user.id)
        .await?
        .iter()
        .map(|row| SessionBody::from_row(row, current.id))
        .collect();
    Ok(Json(SessionsResponse { sessions }).into_response())
}

#[utoipa::path(
    delete,
    path = "/session",
    responses(
        (status = 200, description = "All of the caller's sessions revoked", body = RevokeAllResponse),
        (status = 401, description = "No active session")
    ),
    tag = "session"
)]
pub async fn revoke_all(
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    config: Extension<ApiConfig>,
) -> Result<Response, ServiceError> {
    let Some((user, _)) = extract_principal(&headers, &auth).await? else {
        return Err(ServiceError::authentication("Sign in first"));
    };
    let count = auth.sessions().revoke_all(user.id).await?;
    let mut response = Json(RevokeAllResponse {
        success: true,
        count,
    })
    .into_response();
    match clear_session_cookie(config.production) {
        Ok(cookie) => {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build clearing cookie: {err}"),
    }
    Ok(response)
}
