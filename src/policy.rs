//! Organization security policy: defaults, merging, and evaluation.
//!
//! A stored policy document is partial; every field merges over the system
//! default individually. "Document absent" therefore resolves to the full
//! default policy, while "fetch failed" resolves to `None`. Callers treat
//! those differently: some checks are permissive on a failed fetch and
//! restrictive on a present-but-strict policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::store::CredentialStore;

pub const DEFAULT_PASSWORD_MIN_LENGTH: u32 = 8;
pub const DEFAULT_SESSION_TIMEOUT_MINS: i64 = 12 * 60;
pub const DEFAULT_MAX_SESSIONS_PER_USER: u32 = 5;
pub const DEFAULT_PASSWORD_EXPIRY_DAYS: i64 = 0;

/// Second-factor methods an organization may allow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MfaMethod {
    Totp,
    Sms,
    Email,
}

impl MfaMethod {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

/// Effective security policy with every field populated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub password_min_length: u32,
    pub require_mfa: bool,
    pub allowed_mfa_methods: Vec<MfaMethod>,
    pub session_timeout_mins: i64,
    pub max_sessions_per_user: u32,
    pub ip_allowlist_enabled: bool,
    pub ip_allowlist: Vec<String>,
    pub ip_denylist: Vec<String>,
    pub require_reauth_for_sensitive: bool,
    pub sensitive_actions: Vec<String>,
    pub password_expiry_days: i64,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            password_min_length: DEFAULT_PASSWORD_MIN_LENGTH,
            require_mfa: false,
            allowed_mfa_methods: vec![MfaMethod::Totp, MfaMethod::Email],
            session_timeout_mins: DEFAULT_SESSION_TIMEOUT_MINS,
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            ip_allowlist_enabled: false,
            ip_allowlist: Vec::new(),
            ip_denylist: Vec::new(),
            require_reauth_for_sensitive: false,
            sensitive_actions: vec!["delete_account".to_string()],
            password_expiry_days: DEFAULT_PASSWORD_EXPIRY_DAYS,
        }
    }
}

/// Partially specified stored policy document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub password_min_length: Option<u32>,
    pub require_mfa: Option<bool>,
    pub allowed_mfa_methods: Option<Vec<MfaMethod>>,
    pub session_timeout_mins: Option<i64>,
    pub max_sessions_per_user: Option<u32>,
    pub ip_allowlist_enabled: Option<bool>,
    pub ip_allowlist: Option<Vec<String>>,
    pub ip_denylist: Option<Vec<String>>,
    pub require_reauth_for_sensitive: Option<bool>,
    pub sensitive_actions: Option<Vec<String>>,
    pub password_expiry_days: Option<i64>,
}

impl PolicyDocument {
    /// Field-level merge over system defaults. A field the document does not
    /// set keeps its default; the document as a whole never replaces it.
    #[must_use]
    pub fn merge_over_defaults(self) -> SecurityPolicy {
        let defaults = SecurityPolicy::default();
        SecurityPolicy {
            password_min_length: self
                .password_min_length
                .unwrap_or(defaults.password_min_length),
            require_mfa: self.require_mfa.unwrap_or(defaults.require_mfa),
            allowed_mfa_methods: self
                .allowed_mfa_methods
                .unwrap_or(defaults.allowed_mfa_methods),
            session_timeout_mins: self
                .session_timeout_mins
                .unwrap_or(defaults.session_timeout_mins),
            max_sessions_per_user: self
                .max_sessions_per_user
                .unwrap_or(defaults.max_sessions_per_user),
            ip_allowlist_enabled: self
                .ip_allowlist_enabled
                .unwrap_or(defaults.ip_allowlist_enabled),
            ip_allowlist: self.ip_allowlist.unwrap_or(defaults.ip_allowlist),
            ip_denylist: self.ip_denylist.unwrap_or(defaults.ip_denylist),
            require_reauth_for_sensitive: self
                .require_reauth_for_sensitive
                .unwrap_or(defaults.require_reauth_for_sensitive),
            sensitive_actions: self.sensitive_actions.unwrap_or(defaults.sensitive_actions),
            password_expiry_days: self
                .password_expiry_days
                .unwrap_or(defaults.password_expiry_days),
        }
    }
}

/// Why a password failed policy validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PasswordViolation {
    TooShort { min: u32 },
    MissingLetter,
    MissingDigit,
}

impl std::fmt::Display for PasswordViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { min } => write!(f, "password must be at least {min} characters"),
            Self::MissingLetter => write!(f, "password must contain a letter"),
            Self::MissingDigit => write!(f, "password must contain a digit"),
        }
    }
}

/// Validate a password against an effective policy. Deterministic: the same
/// password and policy always yield the same result.
pub fn validate_password_with(
    policy: &SecurityPolicy,
    password: &str,
) -> Result<(), PasswordViolation> {
    let length = u32::try_from(password.chars().count()).unwrap_or(u32::MAX);
    if length < policy.password_min_length {
        return Err(PasswordViolation::TooShort {
            min: policy.password_min_length,
        });
    }
    if !password.chars().any(char::is_alphabetic) {
        return Err(PasswordViolation::MissingLetter);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordViolation::MissingDigit);
    }
    Ok(())
}

/// Whether a password set at `last_change` has expired under `expiry_days`
/// as of `now`. Zero days disables expiry.
#[must_use]
pub fn password_expired_at(last_change: DateTime<Utc>, expiry_days: i64, now: DateTime<Utc>) -> bool {
    if expiry_days <= 0 {
        return false;
    }
    now >= last_change + Duration::days(expiry_days)
}

/// IP decision against an effective policy. The denylist always takes
/// precedence; an enabled-but-empty allowlist denies everything.
#[must_use]
pub fn ip_allowed_by(policy: &SecurityPolicy, ip: &str) -> bool {
    if policy.ip_denylist.iter().any(|denied| denied == ip) {
        return false;
    }
    if !policy.ip_allowlist_enabled {
        return true;
    }
    policy.ip_allowlist.iter().any(|allowed| allowed == ip)
}

/// Read-through evaluator over stored policy documents. No caching: every
/// question re-reads the document so policy changes apply immediately.
#[derive(Clone)]
pub struct SecurityPolicyEvaluator {
    store: Arc<dyn CredentialStore>,
}

impl SecurityPolicyEvaluator {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolve an organization's effective policy.
    ///
    /// - No organization context, or no stored document: full defaults.
    /// - Stored partial document: field-level merge over defaults.
    /// - Store fetch failure: `None`; callers decide fail-open/fail-closed.
    pub async fn organization_policy(&self, org_id: Option<Uuid>) -> Option<SecurityPolicy> {
        let Some(org_id) = org_id else {
            return Some(SecurityPolicy::default());
        };
        match self.store.get_organization_policy(org_id).await {
            Ok(Some(document)) => Some(document.merge_over_defaults()),
            Ok(None) => Some(SecurityPolicy::default()),
            Err(err) => {
                warn!(%org_id, "policy fetch failed, treating as no policy: {err}");
                None
            }
        }
    }

    /// Whether MFA must gate this user's login. Fail-open on fetch failure:
    /// a broken policy store must not lock every user out, so only a policy
    /// that is actually readable can demand MFA. Users who enrolled a second
    /// factor keep it regardless.
    pub async fn is_mfa_required_for_user(
        &self,
        mfa_enabled: bool,
        org_id: Option<Uuid>,
    ) -> bool {
        if mfa_enabled {
            return true;
        }
        match self.organization_policy(org_id).await {
            Some(policy) => policy.require_mfa,
            None => false,
        }
    }

    pub async fn allowed_mfa_methods(&self, org_id: Option<Uuid>) -> Vec<MfaMethod> {
        self.organization_policy(org_id)
            .await
            .unwrap_or_default()
            .allowed_mfa_methods
    }

    pub async fn session_timeout(&self, org_id: Option<Uuid>) -> Duration {
        let mins = self
            .organization_policy(org_id)
            .await
            .unwrap_or_default()
            .session_timeout_mins;
        Duration::minutes(mins)
    }

    pub async fn max_sessions_per_user(&self, org_id: Option<Uuid>) -> u32 {
        self.organization_policy(org_id)
            .await
            .unwrap_or_default()
            .max_sessions_per_user
    }

    pub async fn validate_password(
        &self,
        password: &str,
        org_id: Option<Uuid>,
    ) -> Result<(), PasswordViolation> {
        let policy = self.organization_policy(org_id).await.unwrap_or_default();
        validate_password_with(&policy, password)
    }

    /// Whether the user's password has expired. False when expiry is
    /// disabled or the profile lookup fails.
    pub async fn has_password_expired(&self, user_id: Uuid, org_id: Option<Uuid>) -> bool {
        let policy = self.organization_policy(org_id).await.unwrap_or_default();
        if policy.password_expiry_days <= 0 {
            return false;
        }
        match self.store.get_user_profile(user_id).await {
            Ok(Some(profile)) => password_expired_at(
                profile.last_password_change,
                policy.password_expiry_days,
                Utc::now(),
            ),
            Ok(None) => false,
            Err(err) => {
                warn!(%user_id, "profile lookup failed during expiry check: {err}");
                false
            }
        }
    }

    /// Fail-open on missing policy; fail-closed once allowlisting is
    /// engaged.
    pub async fn is_ip_allowed(&self, ip: &str, org_id: Option<Uuid>) -> bool {
        match self.organization_policy(org_id).await {
            Some(policy) => ip_allowed_by(&policy, ip),
            None => {
                warn!("policy unavailable, allowing IP fail-open");
                true
            }
        }
    }

    pub async fn requires_reauth_for_action(&self, action: &str, org_id: Option<Uuid>) -> bool {
        match self.organization_policy(org_id).await {
            Some(policy) => {
                policy.require_reauth_for_sensitive
                    && policy.sensitive_actions.iter().any(|a| a == action)
            }
            None => false,
        }
    }
}
