//! Double-submit CSRF protection.
//!
//! Stateless: the anti-forgery token lives in a cookie and must be mirrored
//! in a request header on every mutating request. Validity is purely
//! "cookie value equals header value", compared in constant time. Safe
//! methods seed the cookie for first-time visitors; unsafe methods are
//! short-circuited with 403 before the wrapped handler runs.

use anyhow::Result;
use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue, Method, header::SET_COOKIE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use crate::error::ServiceError;
use crate::token::{generate_token, tokens_match};

pub const DEFAULT_COOKIE_NAME: &str = "csrf-token";
pub const DEFAULT_HEADER_NAME: &str = "x-csrf-token";
const DEFAULT_MAX_AGE_SECONDS: i64 = 24 * 60 * 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Lax => "lax",
            Self::None => "none",
        }
    }
}

/// Cookie attributes for the token cookie.
#[derive(Clone, Debug)]
pub struct CookieOptions {
    pub http_only: bool,
    pub same_site: SameSite,
    pub secure: bool,
    pub max_age_seconds: i64,
    pub path: String,
}

impl CookieOptions {
    /// Production gets `SameSite=strict; Secure`; everything else is lax and
    /// works over plain HTTP for local development.
    #[must_use]
    pub fn for_environment(production: bool) -> Self {
        Self {
            http_only: true,
            same_site: if production {
                SameSite::Strict
            } else {
                SameSite::Lax
            },
            secure: production,
            max_age_seconds: DEFAULT_MAX_AGE_SECONDS,
            path: "/".to_string(),
        }
    }
}

/// Token source used by the guard. The default is cryptographically random;
/// callers may substitute their own generation or extraction.
pub trait CsrfTokenProvider: Send + Sync {
    /// Mint a fresh token (at least 32 bytes of entropy).
    fn generate(&self) -> Result<String>;

    /// Read the token presented by the client.
    fn read(&self, headers: &HeaderMap, cookie_name: &str) -> Option<String> {
        extract_cookie_value(headers, cookie_name)
    }

    /// Attach a newly minted token to the outgoing response.
    fn save(&self, response: &mut Response, cookie: HeaderValue) {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
}

#[derive(Clone, Debug, Default)]
pub struct RandomTokenProvider;

impl CsrfTokenProvider for RandomTokenProvider {
    fn generate(&self) -> Result<String> {
        generate_token()
    }
}

type RejectHandler = Arc<dyn Fn() -> Response + Send + Sync>;

#[derive(Clone, Debug)]
pub struct CsrfConfig {
    pub cookie_name: String,
    pub header_name: String,
    pub safe_methods: Vec<Method>,
    pub cookie: CookieOptions,
}

impl CsrfConfig {
    #[must_use]
    pub fn new(production: bool) -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            header_name: DEFAULT_HEADER_NAME.to_string(),
            safe_methods: vec![Method::GET, Method::HEAD, Method::OPTIONS],
            cookie: CookieOptions::for_environment(production),
        }
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    #[must_use]
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    #[must_use]
    pub fn with_safe_methods(mut self, methods: Vec<Method>) -> Self {
        self.safe_methods = methods;
        self
    }

    #[must_use]
    pub fn with_cookie_options(mut self, cookie: CookieOptions) -> Self {
        self.cookie = cookie;
        self
    }
}

/// The middleware itself. Wrap a router with
/// `axum::middleware::from_fn` delegating to [`CsrfGuard::handle`].
pub struct CsrfGuard {
    config: CsrfConfig,
    provider: Arc<dyn CsrfTokenProvider>,
    on_reject: Option<RejectHandler>,
}

impl CsrfGuard {
    #[must_use]
    pub fn new(config: CsrfConfig) -> Self {
        Self {
            config,
            provider: Arc::new(RandomTokenProvider),
            on_reject: None,
        }
    }

    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn CsrfTokenProvider>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_reject_handler(mut self, handler: RejectHandler) -> Self {
        self.on_reject = Some(handler);
        self
    }

    #[must_use]
    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    pub async fn handle(&self, request: Request, next: Next) -> Response {
        if self.config.safe_methods.contains(request.method()) {
            let seeded = self
                .provider
                .read(request.headers(), &self.config.cookie_name)
                .is_some();
            let mut response = next.run(request).await;
            if !seeded {
                self.seed_cookie(&mut response);
            }
            return response;
        }

        let cookie = self
            .provider
            .read(request.headers(), &self.config.cookie_name);
        let header = request
            .headers()
            .get(&self.config.header_name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        match (cookie, header) {
            (Some(cookie), Some(header)) if tokens_match(&cookie, &header) => {
                next.run(request).await
            }
            _ => self.reject(),
        }
    }

    fn seed_cookie(&self, response: &mut Response) {
        let token = match self.provider.generate() {
            Ok(token) => token,
            Err(err) => {
                error!("Failed to generate CSRF token: {err}");
                return;
            }
        };
        let cookie = build_cookie(&self.config.cookie_name, &token, &self.config.cookie);
        match HeaderValue::from_str(&cookie) {
            Ok(value) => self.provider.save(response, value),
            Err(err) => error!("Failed to build CSRF cookie header: {err}"),
        }
    }

    fn reject(&self) -> Response {
        if let Some(handler) = &self.on_reject {
            return handler();
        }
        ServiceError::authorization("Invalid CSRF token").into_response()
    }
}

/// Render the token cookie with the configured attributes.
#[must_use]
pub fn build_cookie(name: &str, token: &str, options: &CookieOptions) -> String {
    let mut cookie = format!(
        "{name}={token}; Path={path}; SameSite={same_site}; Max-Age={max_age}",
        path = options.path,
        same_site = options.same_site.as_str(),
        max_age = options.max_age_seconds,
    );
    if options.http_only {
        cookie.push_str("; HttpOnly");
    }
    if options.secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Pull a single cookie value out of the `Cookie` request header.
pub(crate) fn extract_cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name {
            return Some(val.to_string());
        }
    }
    None
}
