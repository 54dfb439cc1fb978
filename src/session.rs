//! Session lifecycle: creation under policy caps, refresh, revocation,
//! and enumeration.
//!
//! Sessions are presented as opaque bearer/cookie tokens; only the SHA-256
//! hash is persisted. Timeout handling is lazy: a session past `expires_at`
//! is treated as revoked wherever it is read, so no background sweeper is
//! needed.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::policy::SecurityPolicyEvaluator;
use crate::store::{CredentialStore, NewSession, SessionRow, StoreError};
use crate::token::{generate_token, hash_token};

/// Request context carried into authentication flows.
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub org_id: Option<Uuid>,
    pub device_id: Option<String>,
}

/// A freshly created session plus the raw token handed to the client.
#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub session: SessionRow,
    pub token: String,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    policy: SecurityPolicyEvaluator,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, policy: SecurityPolicyEvaluator) -> Self {
        Self { store, policy }
    }

    /// Create a session for the user, enforcing the policy cap (oldest
    /// active sessions are evicted first). The cap check and insert run
    /// under the store's native atomicity.
    pub async fn create(
        &self,
        user_id: Uuid,
        context: &SessionContext,
    ) -> Result<IssuedSession, ServiceError> {
        let timeout = self.policy.session_timeout(context.org_id).await;
        let cap = self.policy.max_sessions_per_user(context.org_id).await;

        let token = generate_token()?;
        let now = Utc::now();
        let session = self
            .store
            .create_session(
                NewSession {
                    user_id,
                    token_hash: hash_token(&token),
                    issued_at: now,
                    expires_at: now + timeout,
                    ip_address: context.ip_address.clone(),
                    user_agent: context.user_agent.clone(),
                },
                cap,
            )
            .await
            .map_err(store_error)?;

        Ok(IssuedSession { session, token })
    }

    /// Resolve a presented token into its active session, if any.
    pub async fn authenticate(&self, token: &str) -> Result<Option<SessionRow>, ServiceError> {
        let row = self
            .store
            .find_session_by_token_hash(&hash_token(token))
            .await
            .map_err(store_error)?;
        Ok(row.filter(|session| session.is_active_at(Utc::now())))
    }

    /// Look up a presented token without the active filter. Used where the
    /// caller must distinguish "already revoked/expired" from "unknown".
    pub async fn lookup(&self, token: &str) -> Result<Option<SessionRow>, ServiceError> {
        self.store
            .find_session_by_token_hash(&hash_token(token))
            .await
            .map_err(store_error)
    }

    /// Extend the session to `now + policy timeout`. The timeout comes from
    /// the session owner's organization, never from the caller. Returns false
    /// when the session is revoked or already past expiry; callers must then
    /// force a re-login. Safe to race: last writer wins on the new expiry.
    pub async fn refresh(&self, token: &str) -> Result<bool, ServiceError> {
        let Some(session) = self.authenticate(token).await? else {
            return Ok(false);
        };
        let org_id = self
            .store
            .get_user_profile(session.user_id)
            .await
            .map_err(store_error)?
            .and_then(|profile| profile.org_id);
        let timeout = self.policy.session_timeout(org_id).await;
        self.store
            .update_session_expiry(session.id, Utc::now() + timeout)
            .await
            .map_err(store_error)
    }

    /// Idempotent revoke by session id.
    pub async fn revoke(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        self.store.revoke_session(session_id).await.map_err(store_error)
    }

    /// Idempotent revoke by presented token.
    pub async fn revoke_by_token(&self, token: &str) -> Result<Option<SessionRow>, ServiceError> {
        let Some(session) = self.lookup(token).await? else {
            return Ok(None);
        };
        self.store
            .revoke_session(session.id)
            .await
            .map_err(store_error)?;
        Ok(Some(session))
    }

    /// Revoke every active session of the user; returns the count actually
    /// revoked.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        self.store.revoke_all_sessions(user_id).await.map_err(store_error)
    }

    /// Revoke every active session except `keep`.
    pub async fn revoke_others(&self, user_id: Uuid, keep: Uuid) -> Result<u64, ServiceError> {
        self.store
            .revoke_other_sessions(user_id, keep)
            .await
            .map_err(store_error)
    }

    /// Active sessions only, newest first.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<SessionRow>, ServiceError> {
        self.store.find_sessions_by_user(user_id).await.map_err(store_error)
    }
}

pub(crate) fn store_error(err: StoreError) -> ServiceError {
    match err {
        StoreError::Conflict(what) => ServiceError::conflict(what),
        StoreError::Unavailable(err) => ServiceError::database(format!("{err:#}")),
    }
}
