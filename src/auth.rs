//! The authentication state machine.
//!
//! `AuthService` orchestrates login, registration, passwordless links,
//! password reset and update, MFA gating, OAuth completion, token refresh,
//! and account deletion. Collaborators are injected at construction and a
//! typed observer list reports every completed transition into
//! `authenticated` or back to `anonymous`.
//!
//! Business failures (wrong password, expired link, policy violation) come
//! back as outcome variants; only infrastructure problems surface as
//! [`ServiceError`].

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arena::ExpiringArena;
use crate::error::ServiceError;
use crate::mfa::{CodeSender, MfaCheckOutcome, MfaController, MfaResendOutcome, MfaVerifyOutcome};
use crate::oauth::{ExternalIdentity, OAuthCallbackOutcome, OAuthExchanger, OAuthProviderConfig};
use crate::policy::{MfaMethod, SecurityPolicyEvaluator};
use crate::session::{SessionContext, SessionManager, store_error};
use crate::store::{CredentialStore, NewUser, SessionRow, StoreError, UserRecord};
use crate::token::{generate_token, hash_token};

const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_MAGIC_LINK_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_REAUTH_FRESH_WINDOW_SECONDS: i64 = 5 * 60;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    reset_token_ttl_seconds: i64,
    magic_link_ttl_seconds: i64,
    verification_token_ttl_seconds: i64,
    reauth_fresh_window_seconds: i64,
    auto_login_after_register: bool,
    revoke_sessions_on_password_change: bool,
    base_url: url::Url,
}

impl AuthConfig {
    #[must_use]
    pub fn new(base_url: url::Url) -> Self {
        Self {
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
            magic_link_ttl_seconds: DEFAULT_MAGIC_LINK_TTL_SECONDS,
            verification_token_ttl_seconds: DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS,
            reauth_fresh_window_seconds: DEFAULT_REAUTH_FRESH_WINDOW_SECONDS,
            auto_login_after_register: true,
            revoke_sessions_on_password_change: true,
            base_url,
        }
    }

    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_magic_link_ttl_seconds(mut self, seconds: i64) -> Self {
        self.magic_link_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_verification_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.verification_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reauth_fresh_window_seconds(mut self, seconds: i64) -> Self {
        self.reauth_fresh_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_auto_login_after_register(mut self, enabled: bool) -> Self {
        self.auto_login_after_register = enabled;
        self
    }

    #[must_use]
    pub fn with_revoke_sessions_on_password_change(mut self, enabled: bool) -> Self {
        self.revoke_sessions_on_password_change = enabled;
        self
    }
}

/// Primary credentials presented at login.
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

/// A fully authenticated principal: the user plus the session and the raw
/// token handed to the client exactly once.
#[derive(Clone, Debug)]
pub struct AuthSuccess {
    pub user: UserRecord,
    pub session: SessionRow,
    pub token: String,
}

/// Completed state transitions reported to observers.
#[derive(Clone, Debug)]
pub enum AuthEvent {
    SignedIn { user_id: Uuid, session_id: Uuid },
    SignedOut { user_id: Uuid },
}

/// Handle returned by [`AuthService::on_auth_state_changed`]; unsubscribing
/// twice is a no-op.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ObserverId(u64);

/// A business-level denial: stable machine code plus a message suitable for
/// inline form feedback.
#[derive(Clone, Debug)]
pub struct Denial {
    pub code: &'static str,
    pub message: String,
}

impl Denial {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum LoginOutcome {
    Authenticated(AuthSuccess),
    /// Credentials were valid; a second factor must complete the login.
    MfaRequired {
        access_token: String,
        methods: Vec<MfaMethod>,
    },
    Denied(Denial),
}

#[derive(Clone, Debug)]
pub enum RegisterOutcome {
    Registered {
        user: UserRecord,
        login: Option<AuthSuccess>,
    },
    Denied(Denial),
}

#[derive(Clone, Debug)]
pub enum MfaLoginOutcome {
    Authenticated {
        success: AuthSuccess,
        remember_token: Option<String>,
    },
    Denied(Denial),
}

#[derive(Clone, Debug)]
pub enum MagicLinkOutcome {
    Authenticated(AuthSuccess),
    /// Unknown, already used, or past its window.
    LinkExpired,
}

#[derive(Clone, Debug)]
pub enum PasswordResetOutcome {
    Authenticated(AuthSuccess),
    LinkExpired,
    Denied(Denial),
}

#[derive(Clone, Debug)]
pub enum UpdatePasswordOutcome {
    Updated { other_sessions_revoked: u64 },
    Denied(Denial),
}

#[derive(Clone, Debug)]
pub enum DeleteAccountOutcome {
    Deleted { sessions_revoked: u64 },
    Denied(Denial),
}

type AuthObserver = Box<dyn Fn(&AuthEvent) + Send + Sync>;

pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    policy: SecurityPolicyEvaluator,
    sessions: SessionManager,
    mfa: Arc<MfaController>,
    oauth: Arc<OAuthExchanger>,
    sender: Arc<dyn CodeSender>,
    config: AuthConfig,
    reset_tokens: ExpiringArena<Uuid>,
    magic_links: ExpiringArena<Uuid>,
    verification_tokens: ExpiringArena<Uuid>,
    observers: Mutex<Vec<(u64, AuthObserver)>>,
    observer_seq: AtomicU64,
}

impl AuthService {
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        policy: SecurityPolicyEvaluator,
        sessions: SessionManager,
        mfa: Arc<MfaController>,
        oauth: Arc<OAuthExchanger>,
        sender: Arc<dyn CodeSender>,
        config: AuthConfig,
    ) -> Self {
        Self {
            store,
            policy,
            sessions,
            mfa,
            oauth,
            sender,
            config,
            reset_tokens: ExpiringArena::new(),
            magic_links: ExpiringArena::new(),
            verification_tokens: ExpiringArena::new(),
            observers: Mutex::new(Vec::new()),
            observer_seq: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn policy(&self) -> &SecurityPolicyEvaluator {
        &self.policy
    }

    #[must_use]
    pub fn mfa(&self) -> &MfaController {
        &self.mfa
    }

    // ---- observers ------------------------------------------------------

    /// Register an observer fired on every sign-in and sign-out.
    pub fn on_auth_state_changed<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let id = self.observer_seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut observers) = self.observers.lock() {
            observers.push((id, Box::new(callback)));
        }
        ObserverId(id)
    }

    /// Idempotent unsubscribe.
    pub fn unsubscribe(&self, id: ObserverId) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.retain(|(observer_id, _)| *observer_id != id.0);
        }
    }

    fn notify(&self, event: &AuthEvent) {
        if let Ok(observers) = self.observers.lock() {
            for (_, observer) in observers.iter() {
                observer(event);
            }
        }
    }

    // ---- login ----------------------------------------------------------

    /// Password login. Invalid credentials, IP policy denials, and expired
    /// passwords are denials; when policy demands a second factor no session
    /// exists until [`AuthService::verify_mfa_code`] succeeds.
    pub async fn login(
        &self,
        credentials: &Credentials,
        context: &SessionContext,
    ) -> Result<LoginOutcome, ServiceError> {
        let email = normalize_email(&credentials.email);
        let Some(user) = self.find_live_user(&email).await? else {
            return Ok(LoginOutcome::Denied(invalid_credentials()));
        };
        if !verify_password(&user.password_hash, credentials.password.expose_secret()) {
            return Ok(LoginOutcome::Denied(invalid_credentials()));
        }

        if let Some(ip) = &context.ip_address {
            if !self.policy.is_ip_allowed(ip, user.org_id).await {
                info!(user_id = %user.id, %ip, "login denied by IP policy");
                return Ok(LoginOutcome::Denied(Denial::new(
                    "ip_not_allowed",
                    "Sign-in is not permitted from this network",
                )));
            }
        }

        if self.policy.has_password_expired(user.id, user.org_id).await {
            return Ok(LoginOutcome::Denied(Denial::new(
                "password_expired",
                "Your password has expired and must be reset",
            )));
        }

        self.finish_primary_auth(user, context).await
    }

    /// Shared tail of password, magic-link-less OAuth, and similar primary
    /// flows: apply the MFA gate, then create the session.
    async fn finish_primary_auth(
        &self,
        user: UserRecord,
        context: &SessionContext,
    ) -> Result<LoginOutcome, ServiceError> {
        let mfa_required = self
            .policy
            .is_mfa_required_for_user(user.mfa_enabled, user.org_id)
            .await;
        let trusted = match &context.device_id {
            Some(device_id) => self.mfa.is_device_trusted(user.id, device_id).await,
            None => false,
        };

        if mfa_required && !trusted {
            let challenge = self.mfa.begin_challenge(&user).await?;
            debug!(user_id = %user.id, "second factor required");
            return Ok(LoginOutcome::MfaRequired {
                access_token: challenge.access_token,
                methods: challenge.methods,
            });
        }

        let success = self.open_session(user, context).await?;
        Ok(LoginOutcome::Authenticated(success))
    }

    async fn open_session(
        &self,
        user: UserRecord,
        context: &SessionContext,
    ) -> Result<AuthSuccess, ServiceError> {
        let mut session_context = context.clone();
        session_context.org_id = session_context.org_id.or(user.org_id);
        let issued = self.sessions.create(user.id, &session_context).await?;
        let success = AuthSuccess {
            user,
            session: issued.session,
            token: issued.token,
        };
        self.notify(&AuthEvent::SignedIn {
            user_id: success.user.id,
            session_id: success.session.id,
        });
        Ok(success)
    }

    // ---- registration ---------------------------------------------------

    pub async fn register(
        &self,
        email: &str,
        password: &SecretString,
        context: &SessionContext,
    ) -> Result<RegisterOutcome, ServiceError> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Ok(RegisterOutcome::Denied(Denial::new(
                "invalid_email",
                "Enter a valid email address",
            )));
        }
        if let Err(violation) = self
            .policy
            .validate_password(password.expose_secret(), context.org_id)
            .await
        {
            return Ok(RegisterOutcome::Denied(Denial::new(
                "weak_password",
                violation.to_string(),
            )));
        }

        let password_hash = hash_password(password.expose_secret())?;
        let user = match self
            .store
            .create_user(NewUser {
                email,
                password_hash,
                phone: None,
                org_id: context.org_id,
            })
            .await
        {
            Ok(user) => user,
            Err(StoreError::Conflict(_)) => {
                return Ok(RegisterOutcome::Denied(Denial::new(
                    "email_taken",
                    "An account with this email already exists",
                )));
            }
            Err(err) => return Err(store_error(err)),
        };
        info!(user_id = %user.id, "user registered");

        // A mail outage must not fail the registration itself; the user can
        // ask for a fresh link later.
        if let Err(err) = self.send_verification_email(&user).await {
            warn!(user_id = %user.id, "verification email not sent: {err}");
        }

        let login = if self.config.auto_login_after_register {
            Some(self.open_session(user.clone(), context).await?)
        } else {
            None
        };
        Ok(RegisterOutcome::Registered { user, login })
    }

    // ---- email verification -----------------------------------------------

    /// Email a fresh single-use verification link. Always succeeds for
    /// unknown or already verified addresses so the endpoint cannot be used
    /// to enumerate accounts.
    pub async fn resend_verification_email(&self, email: &str) -> Result<(), ServiceError> {
        let email = normalize_email(email);
        let Some(user) = self.find_live_user(&email).await? else {
            debug!("verification resend requested for unknown email");
            return Ok(());
        };
        if user.email_verified {
            return Ok(());
        }
        self.send_verification_email(&user).await
    }

    /// Redeem a verification token: single-use, idempotently flips the
    /// verified flag. False for an unknown, expired, or replayed token.
    pub async fn verify_email(&self, token: &str) -> Result<bool, ServiceError> {
        let Some(user_id) = self.verification_tokens.take(&arena_key(token)).await else {
            return Ok(false);
        };
        self.store
            .set_email_verified(user_id)
            .await
            .map_err(store_error)?;
        info!(user_id = %user_id, "email verified");
        Ok(true)
    }

    async fn send_verification_email(&self, user: &UserRecord) -> Result<(), ServiceError> {
        let token = generate_token()?;
        self.verification_tokens
            .insert(
                arena_key(&token),
                user.id,
                Duration::seconds(self.config.verification_token_ttl_seconds),
            )
            .await;
        let link = self.link("/auth/verify-email", &token);
        self.sender.send_email(&user.email, &link).map_err(|err| {
            ServiceError::external_service(format!("verification email send failed: {err}"))
        })
    }

    // ---- MFA sub-flow (delegated) ----------------------------------------

    pub async fn check_mfa_requirements(
        &self,
        access_token: &str,
        preferred_method: Option<MfaMethod>,
    ) -> Result<MfaCheckOutcome, ServiceError> {
        self.mfa
            .check_requirements(access_token, preferred_method)
            .await
    }

    /// Complete a pending login with a second-factor code.
    pub async fn verify_mfa_code(
        &self,
        access_token: &str,
        code: &str,
        remember_device: bool,
        context: &SessionContext,
    ) -> Result<MfaLoginOutcome, ServiceError> {
        match self
            .mfa
            .verify_code(access_token, code, remember_device, context)
            .await?
        {
            MfaVerifyOutcome::Verified {
                user_id,
                issued,
                remember_token,
            } => {
                let user = self.require_user(user_id).await?;
                let success = AuthSuccess {
                    user,
                    session: issued.session,
                    token: issued.token,
                };
                self.notify(&AuthEvent::SignedIn {
                    user_id,
                    session_id: success.session.id,
                });
                Ok(MfaLoginOutcome::Authenticated {
                    success,
                    remember_token,
                })
            }
            MfaVerifyOutcome::InvalidCode => Ok(MfaLoginOutcome::Denied(Denial::new(
                "invalid_code",
                "Invalid code, try again",
            ))),
            MfaVerifyOutcome::Expired => Ok(MfaLoginOutcome::Denied(Denial::new(
                "mfa_expired",
                "This challenge has expired, sign in again",
            ))),
            MfaVerifyOutcome::TooManyAttempts => Ok(MfaLoginOutcome::Denied(Denial::new(
                "too_many_attempts",
                "Too many attempts, sign in again",
            ))),
        }
    }

    /// Complete a pending login with a single-use recovery code. The code is
    /// burned even though no device trust is granted.
    pub async fn verify_mfa_recovery_code(
        &self,
        access_token: &str,
        code: &str,
        context: &SessionContext,
    ) -> Result<MfaLoginOutcome, ServiceError> {
        match self
            .mfa
            .verify_recovery_code(access_token, code, context)
            .await?
        {
            MfaVerifyOutcome::Verified {
                user_id, issued, ..
            } => {
                let user = self.require_user(user_id).await?;
                let success = AuthSuccess {
                    user,
                    session: issued.session,
                    token: issued.token,
                };
                self.notify(&AuthEvent::SignedIn {
                    user_id,
                    session_id: success.session.id,
                });
                Ok(MfaLoginOutcome::Authenticated {
                    success,
                    remember_token: None,
                })
            }
            MfaVerifyOutcome::InvalidCode => Ok(MfaLoginOutcome::Denied(Denial::new(
                "invalid_recovery_code",
                "That recovery code is not valid",
            ))),
            MfaVerifyOutcome::Expired => Ok(MfaLoginOutcome::Denied(Denial::new(
                "mfa_expired",
                "This challenge has expired, sign in again",
            ))),
            MfaVerifyOutcome::TooManyAttempts => Ok(MfaLoginOutcome::Denied(Denial::new(
                "too_many_attempts",
                "Too many attempts, sign in again",
            ))),
        }
    }

    /// Mint a fresh recovery-code batch for an authenticated user; `None`
    /// when MFA is not enabled.
    pub async fn generate_mfa_recovery_codes(
        &self,
        user: &UserRecord,
    ) -> Result<Option<Vec<String>>, ServiceError> {
        self.mfa.generate_recovery_codes(user).await
    }

    pub async fn resend_mfa_email_code(
        &self,
        access_token: &str,
    ) -> Result<MfaResendOutcome, ServiceError> {
        self.mfa.resend_email_code(access_token).await
    }

    pub async fn resend_mfa_sms_code(
        &self,
        access_token: &str,
    ) -> Result<MfaResendOutcome, ServiceError> {
        self.mfa.resend_sms_code(access_token).await
    }

    // ---- passwordless ----------------------------------------------------

    /// Email a single-use sign-in link. Always succeeds for unknown
    /// addresses so the endpoint cannot be used to enumerate accounts.
    pub async fn send_magic_link(&self, email: &str) -> Result<(), ServiceError> {
        let email = normalize_email(email);
        let Some(user) = self.find_live_user(&email).await? else {
            debug!("magic link requested for unknown email");
            return Ok(());
        };
        let token = generate_token()?;
        self.magic_links
            .insert(
                arena_key(&token),
                user.id,
                Duration::seconds(self.config.magic_link_ttl_seconds),
            )
            .await;
        let link = self.link("/auth/magic", &token);
        self.sender
            .send_email(&user.email, &link)
            .map_err(|err| ServiceError::external_service(format!("magic link send failed: {err}")))
    }

    /// Redeem a magic link: single-use, yields a full login on success.
    pub async fn verify_magic_link(
        &self,
        token: &str,
        context: &SessionContext,
    ) -> Result<MagicLinkOutcome, ServiceError> {
        let Some(user_id) = self.magic_links.take(&arena_key(token)).await else {
            return Ok(MagicLinkOutcome::LinkExpired);
        };
        let user = self.require_user(user_id).await?;
        let success = self.open_session(user, context).await?;
        Ok(MagicLinkOutcome::Authenticated(success))
    }

    // ---- password reset ---------------------------------------------------

    /// Start a password reset. Like magic links, unknown addresses are
    /// acknowledged without effect.
    pub async fn reset_password(&self, email: &str) -> Result<(), ServiceError> {
        let email = normalize_email(email);
        let Some(user) = self.find_live_user(&email).await? else {
            debug!("password reset requested for unknown email");
            return Ok(());
        };
        let token = generate_token()?;
        self.reset_tokens
            .insert(
                arena_key(&token),
                user.id,
                Duration::seconds(self.config.reset_token_ttl_seconds),
            )
            .await;
        let link = self.link("/auth/reset", &token);
        self.sender
            .send_email(&user.email, &link)
            .map_err(|err| ServiceError::external_service(format!("reset send failed: {err}")))
    }

    /// Non-consuming check used by the reset form before the user types a
    /// new password.
    pub async fn verify_password_reset_token(&self, token: &str) -> bool {
        self.reset_tokens.contains(&arena_key(token)).await
    }

    /// Redeem a reset token. A weak replacement password does not burn the
    /// token; success consumes it, invalidates the user's other outstanding
    /// reset tokens, and signs the user in.
    pub async fn update_password_with_token(
        &self,
        token: &str,
        new_password: &SecretString,
        context: &SessionContext,
    ) -> Result<PasswordResetOutcome, ServiceError> {
        let Some(user_id) = self.reset_tokens.peek(&arena_key(token)).await else {
            return Ok(PasswordResetOutcome::LinkExpired);
        };
        let user = self.require_user(user_id).await?;
        if let Err(violation) = self
            .policy
            .validate_password(new_password.expose_secret(), user.org_id)
            .await
        {
            return Ok(PasswordResetOutcome::Denied(Denial::new(
                "weak_password",
                violation.to_string(),
            )));
        }

        let Some(user_id) = self.reset_tokens.take(&arena_key(token)).await else {
            // Raced with another redemption of the same token.
            return Ok(PasswordResetOutcome::LinkExpired);
        };
        let password_hash = hash_password(new_password.expose_secret())?;
        self.store
            .update_password(user_id, &password_hash, Utc::now())
            .await
            .map_err(store_error)?;
        self.reset_tokens
            .retain(|_, owner| *owner != user_id)
            .await;
        info!(%user_id, "password reset completed");

        let mut user = user;
        user.password_hash = password_hash;
        let success = self.open_session(user, context).await?;
        Ok(PasswordResetOutcome::Authenticated(success))
    }

    /// Authenticated password change; requires the current password.
    pub async fn update_password(
        &self,
        user: &UserRecord,
        current_session: &SessionRow,
        old_password: &SecretString,
        new_password: &SecretString,
    ) -> Result<UpdatePasswordOutcome, ServiceError> {
        if !verify_password(&user.password_hash, old_password.expose_secret()) {
            return Ok(UpdatePasswordOutcome::Denied(invalid_credentials()));
        }
        if let Err(violation) = self
            .policy
            .validate_password(new_password.expose_secret(), user.org_id)
            .await
        {
            return Ok(UpdatePasswordOutcome::Denied(Denial::new(
                "weak_password",
                violation.to_string(),
            )));
        }

        let password_hash = hash_password(new_password.expose_secret())?;
        self.store
            .update_password(user.id, &password_hash, Utc::now())
            .await
            .map_err(store_error)?;
        self.reset_tokens
            .retain(|_, owner| *owner != user.id)
            .await;

        let other_sessions_revoked = if self.config.revoke_sessions_on_password_change {
            self.sessions
                .revoke_others(user.id, current_session.id)
                .await?
        } else {
            0
        };
        info!(user_id = %user.id, other_sessions_revoked, "password updated");
        Ok(UpdatePasswordOutcome::Updated {
            other_sessions_revoked,
        })
    }

    // ---- session lifecycle -------------------------------------------------

    /// Extend the current session under the owner's org policy. False means
    /// the caller must force a re-login; never an error for an inactive
    /// session.
    pub async fn refresh_token(&self, token: &str) -> Result<bool, ServiceError> {
        self.sessions.refresh(token).await
    }

    pub async fn token_expiry(
        &self,
        token: &str,
    ) -> Result<Option<DateTime<Utc>>, ServiceError> {
        Ok(self
            .sessions
            .lookup(token)
            .await?
            .map(|session| session.expires_at))
    }

    /// Client observed its token past expiry: transition back to anonymous.
    /// Sessions already revoked server-side are not revoked again.
    pub async fn handle_session_timeout(&self, token: &str) -> Result<bool, ServiceError> {
        let session = self.sessions.lookup(token).await?;
        let revoked_now = match &session {
            Some(row) if !row.revoked => self.sessions.revoke(row.id).await?,
            _ => false,
        };
        if let Some(row) = session {
            self.notify(&AuthEvent::SignedOut {
                user_id: row.user_id,
            });
        }
        Ok(revoked_now)
    }

    /// Resolve a presented token into its user and active session.
    pub async fn authenticate(
        &self,
        token: &str,
    ) -> Result<Option<(UserRecord, SessionRow)>, ServiceError> {
        let Some(session) = self.sessions.authenticate(token).await? else {
            return Ok(None);
        };
        let user = self
            .store
            .find_user_by_id(session.user_id)
            .await
            .map_err(store_error)?
            .filter(|user| user.deleted_at.is_none());
        Ok(user.map(|user| (user, session)))
    }

    /// Cheap store reachability probe for the health endpoint.
    pub async fn store_reachable(&self) -> bool {
        self.store.find_user_by_id(Uuid::nil()).await.is_ok()
    }

    /// Revoke the presented session. Returns false for tokens that resolve
    /// to nothing; logout is idempotent.
    pub async fn logout(&self, token: &str) -> Result<bool, ServiceError> {
        match self.sessions.revoke_by_token(token).await? {
            Some(session) => {
                self.notify(&AuthEvent::SignedOut {
                    user_id: session.user_id,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---- OAuth --------------------------------------------------------------

    pub fn configure_oauth_provider(&self, config: OAuthProviderConfig) {
        self.oauth.register_provider(config);
    }

    pub async fn oauth_authorization_url(
        &self,
        provider: &str,
        state: Option<String>,
        return_to: Option<String>,
    ) -> Result<url::Url, ServiceError> {
        Ok(self
            .oauth
            .authorization_url(provider, state, return_to)
            .await?
            .url)
    }

    /// Complete an OAuth callback. First-time identities are provisioned as
    /// new users; the result then passes through the same MFA gate as a
    /// password login.
    pub async fn exchange_oauth_code(
        &self,
        provider: &str,
        code: &str,
        state: &str,
        context: &SessionContext,
    ) -> Result<LoginOutcome, ServiceError> {
        let identity = match self.oauth.exchange_code(provider, code, state).await? {
            OAuthCallbackOutcome::Identity(identity) => identity,
            OAuthCallbackOutcome::InvalidState => {
                return Ok(LoginOutcome::Denied(Denial::new(
                    "invalid_state",
                    "This sign-in attempt has expired, start again",
                )));
            }
        };
        let user = match self.resolve_oauth_user(&identity).await? {
            Some(user) => user,
            None => {
                return Ok(LoginOutcome::Denied(Denial::new(
                    "oauth_profile_unusable",
                    "The identity provider did not share an email address",
                )));
            }
        };
        self.finish_primary_auth(user, context).await
    }

    async fn resolve_oauth_user(
        &self,
        identity: &ExternalIdentity,
    ) -> Result<Option<UserRecord>, ServiceError> {
        let Some(email) = identity.email.as_deref().map(normalize_email) else {
            return Ok(None);
        };
        if let Some(user) = self.find_live_user(&email).await? {
            return Ok(Some(user));
        }
        // Provision on first sight. The placeholder password hash never
        // matches any input, so the account stays OAuth-only until the user
        // runs a reset.
        let placeholder = hash_password(&generate_token()?)?;
        match self
            .store
            .create_user(NewUser {
                email: email.clone(),
                password_hash: placeholder,
                phone: None,
                org_id: None,
            })
            .await
        {
            Ok(user) => {
                info!(user_id = %user.id, provider = %identity.provider, "user provisioned from OAuth");
                Ok(Some(user))
            }
            // Lost a race against a concurrent first login.
            Err(StoreError::Conflict(_)) => self.find_live_user(&email).await,
            Err(err) => Err(store_error(err)),
        }
    }

    // ---- account deletion ----------------------------------------------------

    /// Delete the caller's account. A session older than the freshness
    /// window requires the password again; policy may demand re-auth for
    /// this action regardless of age.
    pub async fn delete_account(
        &self,
        user: &UserRecord,
        current_session: &SessionRow,
        password: Option<&SecretString>,
    ) -> Result<DeleteAccountOutcome, ServiceError> {
        let age = Utc::now() - current_session.issued_at;
        let fresh = age <= Duration::seconds(self.config.reauth_fresh_window_seconds);
        let policy_demands_reauth = self
            .policy
            .requires_reauth_for_action("delete_account", user.org_id)
            .await;

        if !fresh || policy_demands_reauth {
            let Some(password) = password else {
                return Ok(DeleteAccountOutcome::Denied(Denial::new(
                    "reauth_required",
                    "Confirm your password to delete this account",
                )));
            };
            if !verify_password(&user.password_hash, password.expose_secret()) {
                return Ok(DeleteAccountOutcome::Denied(invalid_credentials()));
            }
        }

        self.store
            .mark_user_deleted(user.id)
            .await
            .map_err(store_error)?;
        let sessions_revoked = self.sessions.revoke_all(user.id).await?;
        self.notify(&AuthEvent::SignedOut { user_id: user.id });
        warn!(user_id = %user.id, sessions_revoked, "account marked for deletion");
        Ok(DeleteAccountOutcome::Deleted { sessions_revoked })
    }

    // ---- helpers --------------------------------------------------------------

    async fn find_live_user(&self, email: &str) -> Result<Option<UserRecord>, ServiceError> {
        let user = self
            .store
            .find_user_by_email(email)
            .await
            .map_err(store_error)?;
        Ok(user.filter(|user| user.deleted_at.is_none()))
    }

    async fn require_user(&self, user_id: Uuid) -> Result<UserRecord, ServiceError> {
        self.store
            .find_user_by_id(user_id)
            .await
            .map_err(store_error)?
            .filter(|user| user.deleted_at.is_none())
            .ok_or_else(|| ServiceError::not_found("user no longer exists"))
    }

    fn link(&self, path: &str, token: &str) -> String {
        let mut url = self.config.base_url.clone();
        url.set_path(path);
        url.set_query(Some(&format!("token={token}")));
        url.to_string()
    }
}

fn invalid_credentials() -> Denial {
    Denial::new("invalid_credentials", "Invalid email or password")
}

/// One-time tokens are held in the arena keyed by their hash, so raw values
/// never sit in memory longer than the request that carries them.
fn arena_key(token: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash_token(token))
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ServiceError::internal(&format!("password hashing failed: {err}")))
}

fn verify_password(stored_hash: &str, password: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::{
        AuthConfig, AuthEvent, AuthService, Credentials, DeleteAccountOutcome, LoginOutcome,
        MagicLinkOutcome, MfaLoginOutcome, PasswordResetOutcome, RegisterOutcome,
        UpdatePasswordOutcome, normalize_email, valid_email,
    };
    use crate::mfa::{CodeSender, MfaConfig, MfaController};
    use crate::oauth::OAuthExchanger;
    use crate::policy::{MfaMethod, PolicyDocument, SecurityPolicyEvaluator};
    use crate::session::{SessionContext, SessionManager};
    use crate::store::{CredentialStore, MemoryStore};
    use anyhow::Result;
    use chrono::{Duration, Utc};
    use secrecy::SecretString;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use url::Url;
    use uuid::Uuid;

    #[derive(Default)]
    struct CapturingSender {
        messages: Mutex<Vec<String>>,
    }

    impl CodeSender for CapturingSender {
        fn send_email(&self, _to: &str, body: &str) -> Result<()> {
            self.messages.lock().expect("lock").push(body.to_string());
            Ok(())
        }

        fn send_sms(&self, _to: &str, body: &str) -> Result<()> {
            self.messages.lock().expect("lock").push(body.to_string());
            Ok(())
        }
    }

    impl CapturingSender {
        fn last(&self) -> Option<String> {
            self.messages.lock().expect("lock").last().cloned()
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        auth: AuthService,
        sender: Arc<CapturingSender>,
    }

    fn fixture_with(config: AuthConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let policy = SecurityPolicyEvaluator::new(store.clone());
        let sessions = SessionManager::new(store.clone(), policy.clone());
        let sender = Arc::new(CapturingSender::default());
        let mfa = Arc::new(MfaController::new(
            store.clone(),
            policy.clone(),
            sessions.clone(),
            sender.clone(),
            MfaConfig::new("custodia"),
        ));
        let auth = AuthService::new(
            store.clone(),
            policy,
            sessions,
            mfa,
            Arc::new(OAuthExchanger::new()),
            sender.clone(),
            config,
        );
        Fixture {
            store,
            auth,
            sender,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AuthConfig::new(
            Url::parse("https://app.example.com").expect("base url"),
        ))
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    async fn register_with(
        f: &Fixture,
        email: &str,
        password: &str,
        context: &SessionContext,
    ) -> super::AuthSuccess {
        match f
            .auth
            .register(email, &secret(password), context)
            .await
            .expect("register")
        {
            RegisterOutcome::Registered { login, .. } => login.expect("auto login"),
            RegisterOutcome::Denied(denial) => panic!("registration denied: {}", denial.code),
        }
    }

    async fn register(f: &Fixture, email: &str, password: &str) -> super::AuthSuccess {
        register_with(f, email, password, &SessionContext::default()).await
    }

    fn link_token(link: &str) -> String {
        Url::parse(link)
            .expect("link url")
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
            .expect("token parameter")
    }

    #[tokio::test]
    async fn register_then_login_round_trips() {
        let f = fixture();
        register(&f, "Alice@Example.com ", "correct horse 1").await;

        let outcome = f
            .auth
            .login(
                &Credentials {
                    email: "alice@example.com".to_string(),
                    password: secret("correct horse 1"),
                },
                &SessionContext::default(),
            )
            .await
            .expect("login");
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_are_the_same_denial() {
        let f = fixture();
        register(&f, "alice@example.com", "correct horse 1").await;

        for (email, password) in [
            ("alice@example.com", "wrong password 9"),
            ("nobody@example.com", "correct horse 1"),
        ] {
            let outcome = f
                .auth
                .login(
                    &Credentials {
                        email: email.to_string(),
                        password: secret(password),
                    },
                    &SessionContext::default(),
                )
                .await
                .expect("login");
            let LoginOutcome::Denied(denial) = outcome else {
                panic!("expected denial");
            };
            assert_eq!(denial.code, "invalid_credentials");
        }
    }

    #[tokio::test]
    async fn weak_password_and_bad_email_are_denied_at_registration() {
        let f = fixture();
        let denied = |outcome: RegisterOutcome| match outcome {
            RegisterOutcome::Denied(denial) => denial.code,
            RegisterOutcome::Registered { .. } => panic!("expected denial"),
        };
        let outcome = f
            .auth
            .register("not-an-email", &secret("long enough 123"), &SessionContext::default())
            .await
            .expect("register");
        assert_eq!(denied(outcome), "invalid_email");

        let outcome = f
            .auth
            .register("bob@example.com", &secret("short1"), &SessionContext::default())
            .await
            .expect("register");
        assert_eq!(denied(outcome), "weak_password");
    }

    #[tokio::test]
    async fn duplicate_registration_is_email_taken() {
        let f = fixture();
        register(&f, "alice@example.com", "correct horse 1").await;
        let outcome = f
            .auth
            .register(
                "alice@example.com",
                &secret("another pass 22"),
                &SessionContext::default(),
            )
            .await
            .expect("register");
        let RegisterOutcome::Denied(denial) = outcome else {
            panic!("expected denial");
        };
        assert_eq!(denial.code, "email_taken");
    }

    #[tokio::test]
    async fn registration_sends_a_verification_link_that_redeems_once() {
        let f = fixture();
        let success = register(&f, "alice@example.com", "correct horse 1").await;
        assert!(!success.user.email_verified);

        let link = f.sender.last().expect("verification link sent");
        let token = link_token(&link);
        assert!(f.auth.verify_email(&token).await.expect("verify"));
        let reloaded = f
            .store
            .find_user_by_id(success.user.id)
            .await
            .expect("find")
            .expect("user");
        assert!(reloaded.email_verified);

        // Single use.
        assert!(!f.auth.verify_email(&token).await.expect("replay"));
        assert!(!f.auth.verify_email("bogus").await.expect("unknown"));
    }

    #[tokio::test]
    async fn verification_resend_is_opaque_and_skips_verified_accounts() {
        let f = fixture();
        register(&f, "alice@example.com", "correct horse 1").await;

        // Unknown addresses get the same silent success as known ones.
        f.auth
            .resend_verification_email("nobody@example.com")
            .await
            .expect("unknown resend");
        let sent_before = f.sender.messages.lock().expect("lock").len();
        assert_eq!(sent_before, 1);

        f.auth
            .resend_verification_email("alice@example.com")
            .await
            .expect("resend");
        let link = f.sender.last().expect("fresh link");
        assert!(f.auth.verify_email(&link_token(&link)).await.expect("verify"));

        // Once verified, a resend sends nothing.
        f.auth
            .resend_verification_email("alice@example.com")
            .await
            .expect("verified resend");
        assert_eq!(f.sender.messages.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn mfa_required_login_creates_no_session_until_verified() {
        let f = fixture();
        let org_id = Uuid::new_v4();
        f.store
            .put_policy(
                org_id,
                PolicyDocument {
                    require_mfa: Some(true),
                    allowed_mfa_methods: Some(vec![MfaMethod::Email]),
                    ..PolicyDocument::default()
                },
            )
            .await;
        let org_context = SessionContext {
            org_id: Some(org_id),
            ..SessionContext::default()
        };
        let success =
            register_with(&f, "alice@example.com", "correct horse 1", &org_context).await;
        let user = success.user.clone();
        f.auth
            .logout(&success.token)
            .await
            .expect("logout after register");

        let outcome = f
            .auth
            .login(
                &Credentials {
                    email: "alice@example.com".to_string(),
                    password: secret("correct horse 1"),
                },
                &SessionContext::default(),
            )
            .await
            .expect("login");
        let LoginOutcome::MfaRequired { access_token, .. } = outcome else {
            panic!("expected MFA gate");
        };
        assert!(f
            .auth
            .sessions()
            .list(user.id)
            .await
            .expect("list")
            .is_empty());

        f.auth
            .check_mfa_requirements(&access_token, Some(MfaMethod::Email))
            .await
            .expect("check");
        let code = f.sender.last().expect("code sent");
        let outcome = f
            .auth
            .verify_mfa_code(&access_token, &code, false, &SessionContext::default())
            .await
            .expect("verify");
        assert!(matches!(outcome, MfaLoginOutcome::Authenticated { .. }));
        assert_eq!(f.auth.sessions().list(user.id).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn recovery_code_completes_the_mfa_gate_once() {
        let f = fixture();
        let org_id = Uuid::new_v4();
        f.store
            .put_policy(
                org_id,
                PolicyDocument {
                    require_mfa: Some(true),
                    allowed_mfa_methods: Some(vec![MfaMethod::Email]),
                    ..PolicyDocument::default()
                },
            )
            .await;
        let org_context = SessionContext {
            org_id: Some(org_id),
            ..SessionContext::default()
        };
        let success =
            register_with(&f, "alice@example.com", "correct horse 1", &org_context).await;
        f.store
            .set_mfa(success.user.id, true, Some("SECRET"))
            .await
            .expect("enable mfa");
        let user = f
            .store
            .find_user_by_id(success.user.id)
            .await
            .expect("find")
            .expect("user");
        f.auth
            .logout(&success.token)
            .await
            .expect("logout after register");

        let codes = f
            .auth
            .generate_mfa_recovery_codes(&user)
            .await
            .expect("generate")
            .expect("codes");

        let login = || async {
            match f
                .auth
                .login(
                    &Credentials {
                        email: "alice@example.com".to_string(),
                        password: secret("correct horse 1"),
                    },
                    &SessionContext::default(),
                )
                .await
                .expect("login")
            {
                LoginOutcome::MfaRequired { access_token, .. } => access_token,
                other => panic!("expected MFA gate, got {other:?}"),
            }
        };

        let access_token = login().await;
        let outcome = f
            .auth
            .verify_mfa_recovery_code(&access_token, &codes[0], &SessionContext::default())
            .await
            .expect("verify");
        assert!(matches!(outcome, MfaLoginOutcome::Authenticated { .. }));

        // The code is burned; a second login cannot reuse it.
        let access_token = login().await;
        let outcome = f
            .auth
            .verify_mfa_recovery_code(&access_token, &codes[0], &SessionContext::default())
            .await
            .expect("replay");
        let MfaLoginOutcome::Denied(denial) = outcome else {
            panic!("expected denial");
        };
        assert_eq!(denial.code, "invalid_recovery_code");
    }

    #[tokio::test]
    async fn denylisted_ip_cannot_sign_in() {
        let f = fixture();
        let org_id = Uuid::new_v4();
        f.store
            .put_policy(
                org_id,
                PolicyDocument {
                    ip_denylist: Some(vec!["203.0.113.9".to_string()]),
                    ..PolicyDocument::default()
                },
            )
            .await;
        let org_context = SessionContext {
            org_id: Some(org_id),
            ..SessionContext::default()
        };
        let success =
            register_with(&f, "alice@example.com", "correct horse 1", &org_context).await;
        f.auth.logout(&success.token).await.expect("logout");

        let credentials = Credentials {
            email: "alice@example.com".to_string(),
            password: secret("correct horse 1"),
        };
        let denied_context = SessionContext {
            ip_address: Some("203.0.113.9".to_string()),
            ..SessionContext::default()
        };
        let outcome = f.auth.login(&credentials, &denied_context).await.expect("login");
        let LoginOutcome::Denied(denial) = outcome else {
            panic!("expected denial");
        };
        assert_eq!(denial.code, "ip_not_allowed");

        let allowed_context = SessionContext {
            ip_address: Some("198.51.100.7".to_string()),
            ..SessionContext::default()
        };
        let outcome = f.auth.login(&credentials, &allowed_context).await.expect("login");
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn expired_password_blocks_login() {
        let f = fixture();
        let org_id = Uuid::new_v4();
        f.store
            .put_policy(
                org_id,
                PolicyDocument {
                    password_expiry_days: Some(30),
                    ..PolicyDocument::default()
                },
            )
            .await;
        let org_context = SessionContext {
            org_id: Some(org_id),
            ..SessionContext::default()
        };
        let success =
            register_with(&f, "alice@example.com", "correct horse 1", &org_context).await;
        f.auth.logout(&success.token).await.expect("logout");
        f.store
            .set_password_changed_at(success.user.id, Utc::now() - Duration::days(90))
            .await;

        let outcome = f
            .auth
            .login(
                &Credentials {
                    email: "alice@example.com".to_string(),
                    password: secret("correct horse 1"),
                },
                &SessionContext::default(),
            )
            .await
            .expect("login");
        let LoginOutcome::Denied(denial) = outcome else {
            panic!("expected denial");
        };
        assert_eq!(denial.code, "password_expired");
    }

    #[tokio::test]
    async fn magic_link_is_single_use() {
        let f = fixture();
        let success = register(&f, "alice@example.com", "correct horse 1").await;
        f.auth.logout(&success.token).await.expect("logout");

        f.auth
            .send_magic_link("Alice@example.com")
            .await
            .expect("send");
        let token = link_token(&f.sender.last().expect("link sent"));

        let outcome = f
            .auth
            .verify_magic_link(&token, &SessionContext::default())
            .await
            .expect("verify");
        assert!(matches!(outcome, MagicLinkOutcome::Authenticated(_)));

        let replay = f
            .auth
            .verify_magic_link(&token, &SessionContext::default())
            .await
            .expect("replay");
        assert!(matches!(replay, MagicLinkOutcome::LinkExpired));
    }

    #[tokio::test]
    async fn magic_link_for_unknown_email_sends_nothing() {
        let f = fixture();
        f.auth
            .send_magic_link("ghost@example.com")
            .await
            .expect("send");
        assert_eq!(f.sender.last(), None);
    }

    #[tokio::test]
    async fn password_reset_consumes_token_and_signs_in() {
        let f = fixture();
        let success = register(&f, "alice@example.com", "correct horse 1").await;
        f.auth.logout(&success.token).await.expect("logout");

        f.auth.reset_password("alice@example.com").await.expect("reset");
        let token = link_token(&f.sender.last().expect("link sent"));
        assert!(f.auth.verify_password_reset_token(&token).await);

        // A weak replacement does not burn the token.
        let outcome = f
            .auth
            .update_password_with_token(&token, &secret("short"), &SessionContext::default())
            .await
            .expect("weak update");
        assert!(matches!(outcome, PasswordResetOutcome::Denied(_)));
        assert!(f.auth.verify_password_reset_token(&token).await);

        let outcome = f
            .auth
            .update_password_with_token(
                &token,
                &secret("brand new pass 9"),
                &SessionContext::default(),
            )
            .await
            .expect("update");
        assert!(matches!(outcome, PasswordResetOutcome::Authenticated(_)));
        assert!(!f.auth.verify_password_reset_token(&token).await);

        let outcome = f
            .auth
            .login(
                &Credentials {
                    email: "alice@example.com".to_string(),
                    password: secret("brand new pass 9"),
                },
                &SessionContext::default(),
            )
            .await
            .expect("login");
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn successful_reset_invalidates_other_outstanding_tokens() {
        let f = fixture();
        register(&f, "alice@example.com", "correct horse 1").await;
        f.auth.reset_password("alice@example.com").await.expect("first");
        let first = link_token(&f.sender.last().expect("first link"));
        f.auth.reset_password("alice@example.com").await.expect("second");
        let second = link_token(&f.sender.last().expect("second link"));

        let outcome = f
            .auth
            .update_password_with_token(
                &second,
                &secret("brand new pass 9"),
                &SessionContext::default(),
            )
            .await
            .expect("update");
        assert!(matches!(outcome, PasswordResetOutcome::Authenticated(_)));
        assert!(!f.auth.verify_password_reset_token(&first).await);
    }

    #[tokio::test]
    async fn update_password_revokes_other_sessions() {
        let f = fixture();
        let first = register(&f, "alice@example.com", "correct horse 1").await;
        let second = match f
            .auth
            .login(
                &Credentials {
                    email: "alice@example.com".to_string(),
                    password: secret("correct horse 1"),
                },
                &SessionContext::default(),
            )
            .await
            .expect("second login")
        {
            LoginOutcome::Authenticated(success) => success,
            _ => panic!("expected login"),
        };

        let outcome = f
            .auth
            .update_password(
                &second.user,
                &second.session,
                &secret("correct horse 1"),
                &secret("brand new pass 9"),
            )
            .await
            .expect("update");
        let UpdatePasswordOutcome::Updated {
            other_sessions_revoked,
        } = outcome
        else {
            panic!("expected update");
        };
        assert_eq!(other_sessions_revoked, 1);
        assert!(f
            .auth
            .sessions()
            .authenticate(&first.token)
            .await
            .expect("authenticate")
            .is_none());
        assert!(f
            .auth
            .sessions()
            .authenticate(&second.token)
            .await
            .expect("authenticate")
            .is_some());
    }

    #[tokio::test]
    async fn update_password_requires_the_old_one() {
        let f = fixture();
        let success = register(&f, "alice@example.com", "correct horse 1").await;
        let outcome = f
            .auth
            .update_password(
                &success.user,
                &success.session,
                &secret("not the password"),
                &secret("brand new pass 9"),
            )
            .await
            .expect("update");
        assert!(matches!(outcome, UpdatePasswordOutcome::Denied(_)));
    }

    #[tokio::test]
    async fn refresh_token_returns_false_after_logout() {
        let f = fixture();
        let success = register(&f, "alice@example.com", "correct horse 1").await;
        assert!(f.auth.refresh_token(&success.token).await.expect("refresh"));
        assert!(f.auth.logout(&success.token).await.expect("logout"));
        assert!(!f.auth.refresh_token(&success.token).await.expect("refresh"));
        assert!(!f.auth.logout(&success.token).await.expect("relogout"));
    }

    #[tokio::test]
    async fn session_timeout_does_not_revoke_twice() {
        let f = fixture();
        let success = register(&f, "alice@example.com", "correct horse 1").await;
        assert!(f
            .auth
            .handle_session_timeout(&success.token)
            .await
            .expect("timeout"));
        assert!(!f
            .auth
            .handle_session_timeout(&success.token)
            .await
            .expect("second timeout"));
    }

    #[tokio::test]
    async fn observers_see_transitions_and_unsubscribe_is_idempotent() {
        let f = fixture();
        let sign_ins = Arc::new(AtomicUsize::new(0));
        let sign_outs = Arc::new(AtomicUsize::new(0));
        let (ins, outs) = (sign_ins.clone(), sign_outs.clone());
        let id = f.auth.on_auth_state_changed(move |event| match event {
            AuthEvent::SignedIn { .. } => {
                ins.fetch_add(1, Ordering::SeqCst);
            }
            AuthEvent::SignedOut { .. } => {
                outs.fetch_add(1, Ordering::SeqCst);
            }
        });

        let success = register(&f, "alice@example.com", "correct horse 1").await;
        f.auth.logout(&success.token).await.expect("logout");
        assert_eq!(sign_ins.load(Ordering::SeqCst), 1);
        assert_eq!(sign_outs.load(Ordering::SeqCst), 1);

        f.auth.unsubscribe(id);
        f.auth.unsubscribe(id);
        register(&f, "bob@example.com", "correct horse 1").await;
        assert_eq!(sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_session_needs_password_to_delete_account() {
        let f = fixture_with(
            AuthConfig::new(Url::parse("https://app.example.com").expect("url"))
                .with_reauth_fresh_window_seconds(0),
        );
        let success = register(&f, "alice@example.com", "correct horse 1").await;

        let outcome = f
            .auth
            .delete_account(&success.user, &success.session, None)
            .await
            .expect("delete");
        let DeleteAccountOutcome::Denied(denial) = outcome else {
            panic!("expected denial");
        };
        assert_eq!(denial.code, "reauth_required");

        let outcome = f
            .auth
            .delete_account(
                &success.user,
                &success.session,
                Some(&secret("correct horse 1")),
            )
            .await
            .expect("delete");
        let DeleteAccountOutcome::Deleted { sessions_revoked } = outcome else {
            panic!("expected deletion");
        };
        assert_eq!(sessions_revoked, 1);

        let outcome = f
            .auth
            .login(
                &Credentials {
                    email: "alice@example.com".to_string(),
                    password: secret("correct horse 1"),
                },
                &SessionContext::default(),
            )
            .await
            .expect("login");
        let LoginOutcome::Denied(denial) = outcome else {
            panic!("expected denial");
        };
        assert_eq!(denial.code, "invalid_credentials");
    }

    #[tokio::test]
    async fn fresh_session_deletes_without_password() {
        let f = fixture();
        let success = register(&f, "alice@example.com", "correct horse 1").await;
        let outcome = f
            .auth
            .delete_account(&success.user, &success.session, None)
            .await
            .expect("delete");
        assert!(matches!(outcome, DeleteAccountOutcome::Deleted { .. }));
    }

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("alice@example.com"));
        assert!(!valid_email("alice@example"));
        assert!(!valid_email("not an email"));
        assert!(!valid_email("@example.com"));
    }
}
