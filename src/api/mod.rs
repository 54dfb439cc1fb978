//! HTTP surface: router assembly, middleware stack, and the server loop.

use anyhow::{Context, Result};
use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{MatchedPath, Request},
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

use crate::auth::AuthService;
use crate::csrf::{CsrfConfig, CsrfGuard};

pub mod handlers;
mod openapi;
pub mod types;

pub use openapi::openapi;

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Per-process API settings threaded through request extensions.
#[derive(Clone, Copy, Debug)]
pub struct ApiConfig {
    /// Hardens cookies (Secure, SameSite=strict) when set.
    pub production: bool,
}

/// Assemble the full application router: routes, CSRF guard, request-id
/// propagation, trace spans, and shared service extensions.
#[must_use]
pub fn router(auth: Arc<AuthService>, config: ApiConfig) -> Router {
    let guard = Arc::new(CsrfGuard::new(CsrfConfig::new(config.production)));
    let csrf = middleware::from_fn(move |request: Request, next: Next| {
        let guard = guard.clone();
        async move { guard.handle(request, next).await }
    });

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/openapi.json", get(openapi_json))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/magic-link", post(handlers::auth::send_magic_link))
        .route(
            "/auth/magic-link/verify",
            post(handlers::auth::verify_magic_link),
        )
        .route("/auth/verify-email", post(handlers::auth::verify_email))
        .route(
            "/auth/verify-email/resend",
            post(handlers::auth::resend_verification),
        )
        .route(
            "/auth/password-reset",
            post(handlers::auth::request_password_reset),
        )
        .route(
            "/auth/password-reset/confirm",
            post(handlers::auth::confirm_password_reset),
        )
        .route("/auth/password", post(handlers::auth::update_password))
        .route("/auth/mfa/check", post(handlers::mfa::check))
        .route("/auth/mfa/verify", post(handlers::mfa::verify))
        .route("/auth/mfa/resend", post(handlers::mfa::resend))
        .route(
            "/auth/oauth/:provider/authorize",
            get(handlers::oauth::authorize),
        )
        .route(
            "/auth/oauth/:provider/callback",
            get(handlers::oauth::callback),
        )
        .route(
            "/session",
            get(handlers::session::list).delete(handlers::session::revoke_all),
        )
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(csrf)
                .layer(Extension(auth))
                .layer(Extension(config)),
        )
}

/// Bind and serve until ctrl-c.
pub async fn serve(port: u16, auth: Arc<AuthService>, config: ApiConfig) -> Result<()> {
    let app = router(auth, config);
    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
