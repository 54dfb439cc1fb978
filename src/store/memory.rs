//! In-memory credential store.
//!
//! Backs the `memory://` DSN for local development and the integration
//! tests. All state lives behind one mutex, so the count-then-insert session
//! cap check runs as a single critical section, the same guarantee the
//! Postgres implementation gets from its per-user transaction lock.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CredentialStore, NewSession, NewUser, RecoveryCodeRow, SessionRow, StoreError, UserProfile,
    UserRecord,
};
use crate::policy::PolicyDocument;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, UserRecord>,
    sessions: HashMap<Uuid, SessionRow>,
    policies: HashMap<Uuid, PolicyDocument>,
    recovery_codes: HashMap<Uuid, (RecoveryCodeRow, bool)>,
    fail_policy_fetch: bool,
    fail_profile_fetch: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace an organization's policy document.
    pub async fn put_policy(&self, org_id: Uuid, document: PolicyDocument) {
        self.inner.lock().await.policies.insert(org_id, document);
    }

    /// Make subsequent policy fetches fail, to exercise the "fetch failure"
    /// path that is distinct from "no document".
    pub async fn fail_policy_fetches(&self, fail: bool) {
        self.inner.lock().await.fail_policy_fetch = fail;
    }

    /// Make subsequent profile fetches fail.
    pub async fn fail_profile_fetches(&self, fail: bool) {
        self.inner.lock().await.fail_profile_fetch = fail;
    }

    /// Backdate a user's password change (test hook for expiry checks).
    pub async fn set_password_changed_at(&self, user_id: Uuid, changed_at: DateTime<Utc>) {
        if let Some(user) = self.inner.lock().await.users.get_mut(&user_id) {
            user.password_changed_at = changed_at;
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("email already registered"));
        }
        let record = UserRecord {
            id: Uuid::new_v4(),
            email: user.email,
            password_hash: user.password_hash,
            email_verified: false,
            password_changed_at: Utc::now(),
            mfa_enabled: false,
            totp_secret: None,
            phone: user.phone,
            org_id: user.org_id,
            deleted_at: None,
        };
        inner.users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::Unavailable(anyhow!("user vanished during update")))?;
        user.password_hash = password_hash.to_string();
        user.password_changed_at = changed_at;
        Ok(())
    }

    async fn set_mfa(
        &self,
        user_id: Uuid,
        enabled: bool,
        totp_secret: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::Unavailable(anyhow!("user vanished during update")))?;
        user.mfa_enabled = enabled;
        user.totp_secret = totp_secret.map(str::to_string);
        Ok(())
    }

    async fn mark_user_deleted(&self, user_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_email_verified(&self, user_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.email_verified = true;
        }
        Ok(())
    }

    async fn replace_recovery_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .recovery_codes
            .retain(|_, (row, _)| row.user_id != user_id);
        for code_hash in code_hashes {
            let row = RecoveryCodeRow {
                id: Uuid::new_v4(),
                user_id,
                code_hash: code_hash.clone(),
            };
            inner.recovery_codes.insert(row.id, (row, false));
        }
        Ok(())
    }

    async fn find_recovery_codes(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RecoveryCodeRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .recovery_codes
            .values()
            .filter(|(row, used)| row.user_id == user_id && !used)
            .map(|(row, _)| row.clone())
            .collect())
    }

    async fn consume_recovery_code(&self, code_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.recovery_codes.get_mut(&code_id) {
            Some((_, used)) if !*used => {
                *used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_session(
        &self,
        session: NewSession,
        max_active: u32,
    ) -> Result<SessionRow, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        // Count and evict under the same lock that performs the insert.
        let mut active: Vec<(Uuid, DateTime<Utc>)> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == session.user_id && s.is_active_at(now))
            .map(|s| (s.id, s.issued_at))
            .collect();
        active.sort_by_key(|(_, issued_at)| *issued_at);

        let cap = max_active as usize;
        if cap > 0 && active.len() >= cap {
            let evict = active.len() - cap + 1;
            for (id, _) in active.into_iter().take(evict) {
                if let Some(row) = inner.sessions.get_mut(&id) {
                    row.revoked = true;
                }
            }
        }

        let row = SessionRow {
            id: Uuid::new_v4(),
            user_id: session.user_id,
            token_hash: session.token_hash,
            issued_at: session.issued_at,
            expires_at: session.expires_at,
            ip_address: session.ip_address,
            user_agent: session.user_agent,
            revoked: false,
        };
        inner.sessions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_session_by_token_hash(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<SessionRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn find_sessions_by_user(&self, user_id: Uuid) -> Result<Vec<SessionRow>, StoreError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut sessions: Vec<SessionRow> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active_at(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(sessions)
    }

    async fn update_session_expiry(
        &self,
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.sessions.get_mut(&session_id) {
            Some(row) if row.is_active_at(now) => {
                row.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.sessions.get_mut(&session_id) {
            Some(row) if row.is_active_at(now) => {
                row.revoked = true;
                Ok(true)
            }
            Some(_) | None => Ok(false),
        }
    }

    async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut revoked = 0u64;
        for row in inner.sessions.values_mut() {
            if row.user_id == user_id && row.is_active_at(now) {
                row.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_other_sessions(&self, user_id: Uuid, keep: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut revoked = 0u64;
        for row in inner.sessions.values_mut() {
            if row.user_id == user_id && row.id != keep && row.is_active_at(now) {
                row.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn get_organization_policy(
        &self,
        org_id: Uuid,
    ) -> Result<Option<PolicyDocument>, StoreError> {
        let inner = self.inner.lock().await;
        if inner.fail_policy_fetch {
            return Err(StoreError::Unavailable(anyhow!("policy store unreachable")));
        }
        Ok(inner.policies.get(&org_id).cloned())
    }

    async fn get_user_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        let inner = self.inner.lock().await;
        if inner.fail_profile_fetch {
            return Err(StoreError::Unavailable(anyhow!(
                "profile store unreachable"
            )));
        }
        Ok(inner.users.get(&user_id).map(|user| UserProfile {
            user_id: user.id,
            org_id: user.org_id,
            last_password_change: user.password_changed_at,
        }))
    }
}
