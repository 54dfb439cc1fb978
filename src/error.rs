//! Typed error taxonomy for infrastructure failures.
//!
//! Business outcomes (wrong password, expired token, MFA mismatch) are never
//! expressed with this type; they are returned as structured outcome values
//! by the services that produce them. `ServiceError` covers the closed set of
//! infrastructure failures a caller may branch on: store unreachable,
//! provider exchange failure, and the like. Unknown errors are normalized
//! into the `Database` kind at the boundary so the set stays closed.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Closed set of failure kinds callers may branch on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimited,
    ExternalService,
    Database,
}

impl ErrorKind {
    /// Default HTTP status hint for the kind.
    #[must_use]
    pub fn status_hint(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimited => 429,
            Self::ExternalService => 502,
            Self::Database => 500,
        }
    }

    /// Default stable machine code for the kind.
    #[must_use]
    pub fn default_code(self) -> &'static str {
        match self {
            Self::Validation => "auth/validation",
            Self::Authentication => "auth/unauthenticated",
            Self::Authorization => "auth/forbidden",
            Self::NotFound => "auth/not-found",
            Self::Conflict => "auth/conflict",
            Self::RateLimited => "auth/rate-limited",
            Self::ExternalService => "auth/external-service",
            Self::Database => "auth/database",
        }
    }
}

/// Infrastructure failure carrying a stable code, HTTP-status hint, and the
/// timestamp at which it was raised. Round-trips through serde including the
/// original timestamp.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ServiceError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.default_code().to_string(),
            message: message.into(),
            status: kind.status_hint(),
            timestamp: Utc::now(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    #[must_use]
    pub fn external_service(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalService, message)
    }

    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    /// Normalize an arbitrary error into the generic service error so
    /// callers only ever see the closed set of kinds.
    #[must_use]
    pub fn internal(err: &(dyn std::fmt::Display)) -> Self {
        Self::new(ErrorKind::Database, err.to_string()).with_code("auth/internal")
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(&err)
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        // Never leak upstream URLs or bodies to clients.
        Self::external_service(err.without_url().to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        // Internal detail stays in the logs; clients get the stable code and
        // a retry-able message.
        let status = self.status_code();
        let message = match self.kind {
            ErrorKind::Database | ErrorKind::ExternalService => {
                tracing::error!(code = %self.code, "service error: {}", self.message);
                "Service temporarily unavailable".to_string()
            }
            _ => self.message,
        };
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, ServiceError};
    use anyhow::Result;
    use axum::{body::to_bytes, response::IntoResponse};
    use serde_json::{Value, json};

    #[test]
    fn kinds_map_to_status_hints() {
        assert_eq!(ErrorKind::Validation.status_hint(), 400);
        assert_eq!(ErrorKind::Authentication.status_hint(), 401);
        assert_eq!(ErrorKind::Authorization.status_hint(), 403);
        assert_eq!(ErrorKind::NotFound.status_hint(), 404);
        assert_eq!(ErrorKind::Conflict.status_hint(), 409);
        assert_eq!(ErrorKind::RateLimited.status_hint(), 429);
        assert_eq!(ErrorKind::ExternalService.status_hint(), 502);
        assert_eq!(ErrorKind::Database.status_hint(), 500);
    }

    #[test]
    fn serialization_round_trips_all_fields() -> Result<()> {
        let original = ServiceError::external_service("token endpoint returned 500")
            .with_details(json!({"provider": "github"}));
        let wire = serde_json::to_string(&original)?;
        let decoded: ServiceError = serde_json::from_str(&wire)?;
        assert_eq!(decoded.kind, original.kind);
        assert_eq!(decoded.code, original.code);
        assert_eq!(decoded.message, original.message);
        assert_eq!(decoded.status, original.status);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.details, original.details);
        Ok(())
    }

    #[test]
    fn internal_normalizes_unknown_errors() {
        let err = ServiceError::internal(&"boom");
        assert_eq!(err.kind, ErrorKind::Database);
        assert_eq!(err.code, "auth/internal");
        assert_eq!(err.status, 500);
    }

    #[tokio::test]
    async fn into_response_keeps_the_status_and_masks_internal_detail() -> Result<()> {
        let response = ServiceError::database("connection refused on 10.0.0.5").into_response();
        assert_eq!(response.status().as_u16(), 500);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(body["error"]["code"], "auth/database");
        assert_eq!(body["error"]["message"], "Service temporarily unavailable");

        let response = ServiceError::authorization("Invalid CSRF token").into_response();
        assert_eq!(response.status().as_u16(), 403);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(body["error"]["message"], "Invalid CSRF token");
        Ok(())
    }

    #[test]
    fn with_code_overrides_default() {
        let err = ServiceError::authorization("Invalid CSRF token");
        assert_eq!(err.code, "auth/forbidden");
        let err = err.with_code("auth/custom");
        assert_eq!(err.code, "auth/custom");
    }
}
