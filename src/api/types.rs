//! Request and response bodies for the HTTP surface.
//!
//! Business denials keep the `{success:false, error, message}` shape so
//! clients branch on `success` and render `message` inline; transport-level
//! failures use the `{error:{code,message}}` envelope from the error module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{AuthSuccess, Denial};
use crate::policy::MfaMethod;
use crate::store::{SessionRow, UserRecord};

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetConfirmRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdatePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MfaCheckRequest {
    pub access_token: String,
    pub preferred_method: Option<MfaMethod>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MfaVerifyRequest {
    pub access_token: String,
    pub code: String,
    #[serde(default)]
    pub remember_device: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MfaResendRequest {
    pub access_token: String,
    pub method: MfaMethod,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthorizeQuery {
    pub return_to: Option<String>,
    /// Caller-committed anti-forgery state; generated when absent.
    pub state: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserBody {
    pub id: Uuid,
    pub email: String,
    pub email_verified: bool,
    pub mfa_enabled: bool,
}

impl From<&UserRecord> for UserBody {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            email_verified: user.email_verified,
            mfa_enabled: user.mfa_enabled,
        }
    }
}

/// Single response shape for every authentication flow step.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mfa_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_methods: Option<Vec<MfaMethod>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserBody>,
}

impl AuthResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn denied(denial: &Denial) -> Self {
        Self {
            success: false,
            error: Some(denial.code.to_string()),
            message: Some(denial.message.clone()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failure(code: &str, message: &str) -> Self {
        Self {
            success: false,
            error: Some(code.to_string()),
            message: Some(message.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn mfa_required(access_token: String, methods: Vec<MfaMethod>) -> Self {
        Self {
            success: true,
            mfa_required: Some(true),
            access_token: Some(access_token),
            available_methods: Some(methods),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn authenticated(success: &AuthSuccess) -> Self {
        Self {
            success: true,
            mfa_required: Some(false),
            token: Some(success.token.clone()),
            user: Some(UserBody::from(&success.user)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionBody {
    pub id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub current: bool,
}

impl SessionBody {
    #[must_use]
    pub fn from_row(row: &SessionRow, current_id: Uuid) -> Self {
        Self {
            id: row.id,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            ip_address: row.ip_address.clone(),
            user_agent: row.user_agent.clone(),
            current: row.id == current_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionBody>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RevokeAllResponse {
    pub success: bool,
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Health {
    pub name: String,
    pub version: String,
    pub database: String,
}
