//! Route handlers and shared request plumbing.

pub mod auth;
pub mod health;
pub mod mfa;
pub mod oauth;
pub mod session;

use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, InvalidHeaderValue, USER_AGENT},
};
use chrono::Utc;

use crate::csrf::extract_cookie_value;
use crate::session::SessionContext;
use crate::store::SessionRow;

pub(crate) const SESSION_COOKIE_NAME: &str = "custodia_session";

/// Request context handed to the auth flows: client address (first
/// `x-forwarded-for` hop), user agent, and the optional device marker used
/// by remember-device.
pub(crate) fn session_context(headers: &HeaderMap) -> SessionContext {
    SessionContext {
        ip_address: headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|ip| ip.trim().to_string()),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        org_id: None,
        device_id: headers
            .get("x-device-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

/// Accept the session token from either a bearer header or the session
/// cookie; the bearer form wins when both are present.
pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    extract_cookie_value(headers, SESSION_COOKIE_NAME)
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Build a `HttpOnly` cookie carrying the session token, aged to the
/// session's own expiry.
pub(crate) fn session_cookie(
    session: &SessionRow,
    token: &str,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let max_age = (session.expires_at - Utc::now()).num_seconds().max(0);
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Expire the session cookie immediately.
pub(crate) fn clear_session_cookie(secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie =
        format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}
