//! Postgres credential store.
//!
//! Every query runs inside a `db.query` span. Multi-row invariants (the
//! session cap) are enforced in a transaction so concurrent logins cannot
//! overshoot the cap between the count and the insert.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    CredentialStore, NewSession, NewUser, RecoveryCodeRow, SessionRow, StoreError, UserProfile,
    UserRecord,
};
use crate::policy::PolicyDocument;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with the standard pool settings.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn query_span(operation: &'static str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn store_err(err: sqlx::Error, what: &'static str) -> StoreError {
    StoreError::Unavailable(anyhow!(err).context(what))
}

fn user_from_row(row: &PgRow) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        email_verified: row.get("email_verified"),
        password_changed_at: row.get("password_changed_at"),
        mfa_enabled: row.get("mfa_enabled"),
        totp_secret: row.get("totp_secret"),
        phone: row.get("phone"),
        org_id: row.get("org_id"),
        deleted_at: row.get("deleted_at"),
    }
}

fn session_from_row(row: &PgRow) -> SessionRow {
    SessionRow {
        id: row.get("id"),
        user_id: row.get("user_id"),
        token_hash: row.get("token_hash"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        revoked: row.get("revoked"),
    }
}

const USER_COLUMNS: &str = "id, email, password_hash, email_verified, password_changed_at, \
     mfa_enabled, totp_secret, phone, org_id, deleted_at";

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|err| store_err(err, "failed to lookup user by email"))?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|err| store_err(err, "failed to lookup user by id"))?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn create_user(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        // password_changed_at is set on insert so the NOT NULL decode in
        // user_from_row holds for every row this store ever reads back.
        let query = format!(
            r"
            INSERT INTO users (email, password_hash, password_changed_at, phone, org_id)
            VALUES ($1, $2, NOW(), $3, $4)
            RETURNING {USER_COLUMNS}
            "
        );
        let row = sqlx::query(&query)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.phone)
            .bind(user.org_id)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", &query))
            .await;
        match row {
            Ok(row) => Ok(user_from_row(&row)),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::Conflict("email already registered"))
            }
            Err(err) => Err(store_err(err, "failed to insert user")),
        }
    }

    async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        changed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = r"
            UPDATE users
            SET password_hash = $2, password_changed_at = $3
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(password_hash)
            .bind(changed_at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to update password"))?;
        Ok(())
    }

    async fn set_mfa(
        &self,
        user_id: Uuid,
        enabled: bool,
        totp_secret: Option<&str>,
    ) -> Result<(), StoreError> {
        let query = r"
            UPDATE users
            SET mfa_enabled = $2, totp_secret = $3
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(enabled)
            .bind(totp_secret)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to update mfa state"))?;
        Ok(())
    }

    async fn mark_user_deleted(&self, user_id: Uuid) -> Result<(), StoreError> {
        let query = r"
            UPDATE users
            SET deleted_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
        ";
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to mark user deleted"))?;
        Ok(())
    }

    async fn create_session(
        &self,
        session: NewSession,
        max_active: u32,
    ) -> Result<SessionRow, StoreError> {
        // Count, evict, and insert inside one transaction. Locking existing
        // session rows would not stop a concurrent insert from slipping past
        // the count, so the user row itself is the serialization point: every
        // login for the same user queues behind this lock.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| store_err(err, "failed to begin session transaction"))?;

        let query = "SELECT id FROM users WHERE id = $1 FOR UPDATE";
        sqlx::query(query)
            .bind(session.user_id)
            .execute(&mut *tx)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|err| store_err(err, "failed to lock user for session insert"))?;

        let query = r"
            SELECT id FROM user_sessions
            WHERE user_id = $1 AND revoked = FALSE AND expires_at > NOW()
            ORDER BY issued_at ASC
        ";
        let active: Vec<Uuid> = sqlx::query(query)
            .bind(session.user_id)
            .fetch_all(&mut *tx)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|err| store_err(err, "failed to count active sessions"))?
            .iter()
            .map(|row| row.get("id"))
            .collect();

        let cap = max_active as usize;
        if cap > 0 && active.len() >= cap {
            let evict: Vec<Uuid> = active[..active.len() - cap + 1].to_vec();
            let query = "UPDATE user_sessions SET revoked = TRUE WHERE id = ANY($1)";
            sqlx::query(query)
                .bind(&evict)
                .execute(&mut *tx)
                .instrument(query_span("UPDATE", query))
                .await
                .map_err(|err| store_err(err, "failed to evict oldest sessions"))?;
        }

        let query = r"
            INSERT INTO user_sessions
                (user_id, token_hash, issued_at, expires_at, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, user_id, token_hash, issued_at, expires_at, ip_address,
                      user_agent, revoked
        ";
        let row = sqlx::query(query)
            .bind(session.user_id)
            .bind(&session.token_hash)
            .bind(session.issued_at)
            .bind(session.expires_at)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .fetch_one(&mut *tx)
            .instrument(query_span("INSERT", query))
            .await;
        let row = match row {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => {
                let _ = tx.rollback().await;
                return Err(StoreError::Conflict("session token collision"));
            }
            Err(err) => return Err(store_err(err, "failed to insert session")),
        };

        tx.commit()
            .await
            .map_err(|err| store_err(err, "failed to commit session transaction"))?;
        Ok(session_from_row(&row))
    }

    async fn find_session_by_token_hash(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<SessionRow>, StoreError> {
        let query = r"
            SELECT id, user_id, token_hash, issued_at, expires_at, ip_address,
                   user_agent, revoked
            FROM user_sessions
            WHERE token_hash = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|err| store_err(err, "failed to lookup session"))?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn find_sessions_by_user(&self, user_id: Uuid) -> Result<Vec<SessionRow>, StoreError> {
        let query = r"
            SELECT id, user_id, token_hash, issued_at, expires_at, ip_address,
                   user_agent, revoked
            FROM user_sessions
            WHERE user_id = $1 AND revoked = FALSE AND expires_at > NOW()
            ORDER BY issued_at DESC
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|err| store_err(err, "failed to list sessions"))?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn update_session_expiry(
        &self,
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = r"
            UPDATE user_sessions
            SET expires_at = $2
            WHERE id = $1 AND revoked = FALSE AND expires_at > NOW()
        ";
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to refresh session"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let query = r"
            UPDATE user_sessions
            SET revoked = TRUE
            WHERE id = $1 AND revoked = FALSE AND expires_at > NOW()
        ";
        let result = sqlx::query(query)
            .bind(session_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to revoke session"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let query = r"
            UPDATE user_sessions
            SET revoked = TRUE
            WHERE user_id = $1 AND revoked = FALSE AND expires_at > NOW()
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to revoke sessions"))?;
        Ok(result.rows_affected())
    }

    async fn revoke_other_sessions(&self, user_id: Uuid, keep: Uuid) -> Result<u64, StoreError> {
        let query = r"
            UPDATE user_sessions
            SET revoked = TRUE
            WHERE user_id = $1 AND id <> $2 AND revoked = FALSE AND expires_at > NOW()
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(keep)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to revoke other sessions"))?;
        Ok(result.rows_affected())
    }

    async fn get_organization_policy(
        &self,
        org_id: Uuid,
    ) -> Result<Option<PolicyDocument>, StoreError> {
        let query = r"
            SELECT security_settings::text AS settings
            FROM org_security_policies
            WHERE org_id = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|err| store_err(err, "failed to fetch organization policy"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let settings: String = row.get("settings");
        let document = serde_json::from_str(&settings)
            .map_err(|err| StoreError::Unavailable(anyhow!("malformed policy document: {err}")))?;
        Ok(Some(document))
    }

    async fn set_email_verified(&self, user_id: Uuid) -> Result<(), StoreError> {
        let query = r"
            UPDATE users
            SET email_verified = TRUE
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to mark email verified"))?;
        Ok(())
    }

    async fn replace_recovery_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<(), StoreError> {
        // Replacing and inserting in one transaction so a failed insert never
        // leaves the user with no valid batch at all.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| store_err(err, "failed to begin recovery-code transaction"))?;

        let query = "DELETE FROM mfa_recovery_codes WHERE user_id = $1";
        sqlx::query(query)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(|err| store_err(err, "failed to clear recovery codes"))?;

        let query = "INSERT INTO mfa_recovery_codes (user_id, code_hash) VALUES ($1, $2)";
        for code_hash in code_hashes {
            sqlx::query(query)
                .bind(user_id)
                .bind(code_hash)
                .execute(&mut *tx)
                .instrument(query_span("INSERT", query))
                .await
                .map_err(|err| store_err(err, "failed to insert recovery code"))?;
        }

        tx.commit()
            .await
            .map_err(|err| store_err(err, "failed to commit recovery-code transaction"))?;
        Ok(())
    }

    async fn find_recovery_codes(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RecoveryCodeRow>, StoreError> {
        let query = r"
            SELECT id, user_id, code_hash
            FROM mfa_recovery_codes
            WHERE user_id = $1 AND used = FALSE
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|err| store_err(err, "failed to list recovery codes"))?;
        Ok(rows
            .iter()
            .map(|row| RecoveryCodeRow {
                id: row.get("id"),
                user_id: row.get("user_id"),
                code_hash: row.get("code_hash"),
            })
            .collect())
    }

    async fn consume_recovery_code(&self, code_id: Uuid) -> Result<bool, StoreError> {
        // Single-use under races: only one UPDATE can flip used to TRUE.
        let query = r"
            UPDATE mfa_recovery_codes
            SET used = TRUE
            WHERE id = $1 AND used = FALSE
        ";
        let result = sqlx::query(query)
            .bind(code_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|err| store_err(err, "failed to consume recovery code"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_user_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        let query = r"
            SELECT id, org_id, password_changed_at
            FROM users
            WHERE id = $1
            LIMIT 1
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|err| store_err(err, "failed to fetch user profile"))?;
        Ok(row.map(|row| UserProfile {
            user_id: row.get("id"),
            org_id: row.get("org_id"),
            last_password_change: row.get("password_changed_at"),
        }))
    }
}
