//! Credential store: the narrow data-provider interface the services
//! depend on.
//!
//! The backing engine is an external collaborator; everything above it talks
//! to this trait only. "Not found" is `Ok(None)`, never an error: store
//! errors always mean the store itself misbehaved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::policy::PolicyDocument;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Store-level failure, distinct from "not found".
#[derive(Debug, Error)]
pub enum StoreError {
    /// Uniqueness violated (email, token hash).
    #[error("conflict: {0}")]
    Conflict(&'static str),
    /// The store itself is unreachable or misbehaving.
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

/// Identity record.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub mfa_enabled: bool,
    pub totp_secret: Option<String>,
    pub phone: Option<String>,
    pub org_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields required to create a user.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub phone: Option<String>,
    pub org_id: Option<Uuid>,
}

/// Persisted session row. Raw tokens never appear here, only their hash.
#[derive(Clone, Debug)]
pub struct SessionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub revoked: bool,
}

impl SessionRow {
    /// Lazy timeout: an expired row is treated as revoked at read time.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Fields required to create a session.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// One stored recovery code. Only the Argon2 hash is persisted; used codes
/// are kept out of reads entirely.
#[derive(Clone, Debug)]
pub struct RecoveryCodeRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
}

/// Minimal profile data the policy evaluator needs.
#[derive(Clone, Debug)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub org_id: Option<Uuid>,
    pub last_password_change: DateTime<Utc>,
}

/// Narrow async interface over the credential store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, StoreError>;

    /// Create a user. Duplicate email is `StoreError::Conflict`.
    async fn create_user(&self, user: NewUser) -> Result<UserRecord, StoreError>;

    /// Replace the password hash and record the change timestamp.
    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Enable or disable MFA, persisting the TOTP secret when enabling.
    async fn set_mfa(
        &self,
        user_id: Uuid,
        enabled: bool,
        totp_secret: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Mark the account for deletion.
    async fn mark_user_deleted(&self, user_id: Uuid) -> Result<(), StoreError>;

    /// Flip the email-verified flag; idempotent.
    async fn set_email_verified(&self, user_id: Uuid) -> Result<(), StoreError>;

    /// Replace the user's recovery codes with a fresh batch of hashes.
    async fn replace_recovery_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), StoreError>;

    /// Unused recovery codes only.
    async fn find_recovery_codes(&self, user_id: Uuid)
        -> Result<Vec<RecoveryCodeRow>, StoreError>;

    /// Burn one recovery code. Returns true only for the first caller; a
    /// replay of an already-used code returns false.
    async fn consume_recovery_code(&self, code_id: Uuid) -> Result<bool, StoreError>;

    /// Create a session, atomically enforcing `max_active` per user: when the
    /// user already holds `max_active` live sessions, the oldest (by
    /// `issued_at`) are revoked first. Implementations must count and insert
    /// under a single consistency guard.
    async fn create_session(
        &self,
        session: NewSession,
        max_active: u32,
    ) -> Result<SessionRow, StoreError>;

    async fn find_session_by_token_hash(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<SessionRow>, StoreError>;

    /// Active sessions only, newest first.
    async fn find_sessions_by_user(&self, user_id: Uuid) -> Result<Vec<SessionRow>, StoreError>;

    /// Extend a session. Returns false when the session is missing, revoked,
    /// or already expired. Last writer wins on `expires_at`.
    async fn update_session_expiry(
        &self,
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Idempotent. Returns true only when the session was active.
    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, StoreError>;

    /// Idempotent. Returns the number of sessions actually revoked.
    async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<u64, StoreError>;

    /// Revoke every active session of the user except `keep`.
    async fn revoke_other_sessions(&self, user_id: Uuid, keep: Uuid) -> Result<u64, StoreError>;

    /// Stored policy document, or `None` when the organization has none.
    async fn get_organization_policy(
        &self,
        org_id: Uuid,
    ) -> Result<Option<PolicyDocument>, StoreError>;

    async fn get_user_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError>;
}
