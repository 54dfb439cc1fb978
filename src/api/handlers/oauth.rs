//! OAuth authorization redirect and callback endpoints.

use axum::{
    Extension,
    extract::{Path, Query},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
};
use std::sync::Arc;

use super::{auth::login_outcome_response, session_context};
use crate::api::ApiConfig;
use crate::api::types::{AuthorizeQuery, CallbackQuery};
use crate::auth::AuthService;
use crate::error::ServiceError;

#[utoipa::path(
    get,
    path = "/auth/oauth/{provider}/authorize",
    params(
        ("provider" = String, Path, description = "Registered provider name")
    ),
    responses(
        (status = 307, description = "Redirect to the provider's authorization endpoint"),
        (status = 404, description = "Unknown provider")
    ),
    tag = "oauth"
)]
pub async fn authorize(
    Path(provider): Path<String>,
    Query(query): Query<AuthorizeQuery>,
    auth: Extension<Arc<AuthService>>,
) -> Result<Response, ServiceError> {
    let url = auth
        .oauth_authorization_url(&provider, query.state, query.return_to)
        .await?;
    Ok(Redirect::temporary(url.as_str()).into_response())
}

#[utoipa::path(
    get,
    path = "/auth/oauth/{provider}/callback",
    params(
        ("provider" = String, Path, description = "Registered provider name")
    ),
    responses(
        (status = 200, description = "Login outcome: authenticated, MFA required, or denied")
    ),
    tag = "oauth"
)]
pub async fn callback(
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
    auth: Extension<Arc<AuthService>>,
    config: Extension<ApiConfig>,
) -> Result<Response, ServiceError> {
    let context = session_context(&headers);
    let outcome = auth
        .exchange_oauth_code(&provider, &query.code, &query.state, &context)
        .await?;
    Ok(login_outcome_response(outcome, config.production))
}
