use axum::{
    Extension, Json,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{debug, error};

use crate::api::types::Health;
use crate::auth::AuthService;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Credential store is reachable", body = Health),
        (status = 503, description = "Credential store is unreachable", body = Health)
    ),
    tag = "health"
)]
pub async fn health(auth: Extension<Arc<AuthService>>) -> impl IntoResponse {
    let store_ok = auth.store_reachable().await;

    let health = Health {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if store_ok {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let mut headers = HeaderMap::new();
    match format!("{}:{}", health.name, health.version).parse::<HeaderValue>() {
        Ok(value) => {
            debug!("X-App header: {:?}", value);
            headers.insert("X-App", value);
        }
        Err(err) => error!("Failed to build X-App header: {err}"),
    }

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, headers, Json(health))
}
