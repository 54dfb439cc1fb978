//! Multi-factor authentication orchestration.
//!
//! Flow overview:
//! 1) When primary credentials succeed but a second factor is required, the
//!    login flow opens a challenge keyed by a temporary access token. No
//!    session exists yet.
//! 2) `check_requirements` selects the delivery method and issues the code.
//! 3) `verify_code` consumes the challenge and promotes the pending login
//!    into a full session; mismatches, expiry, and attempt exhaustion are
//!    business failures, never errors.
//!
//! Challenges live in the expiring arena and always carry an expiry, so an
//! abandoned login leaves nothing behind that needs cleanup. Attempt and
//! resend counters mutate under the arena lock, so the caps hold under
//! concurrent verification attempts.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, rngs::OsRng};
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, warn};
use uuid::Uuid;

pub mod recovery;

use crate::arena::ExpiringArena;
use crate::error::ServiceError;
use crate::policy::{MfaMethod, SecurityPolicyEvaluator};
use crate::session::{IssuedSession, SessionContext, SessionManager, store_error};
use crate::store::{CredentialStore, UserRecord};
use crate::token::{digests_match, generate_token, hash_token};

const DEFAULT_CHALLENGE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_REMEMBER_DEVICE_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const ENROLLMENT_TTL_SECONDS: i64 = 15 * 60;
const ACCESS_TOKEN_PREFIX: &str = "mfa_";

#[derive(Clone, Debug)]
pub struct MfaConfig {
    challenge_ttl_seconds: i64,
    resend_cooldown_seconds: i64,
    max_attempts: u32,
    remember_device_ttl_seconds: i64,
    issuer: String,
}

impl MfaConfig {
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            remember_device_ttl_seconds: DEFAULT_REMEMBER_DEVICE_TTL_SECONDS,
            issuer: issuer.into(),
        }
    }

    #[must_use]
    pub fn with_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: i64) -> Self {
        self.resend_cooldown_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_remember_device_ttl_seconds(mut self, seconds: i64) -> Self {
        self.remember_device_ttl_seconds = seconds;
        self
    }
}

/// Code delivery abstraction for email and SMS factors.
pub trait CodeSender: Send + Sync {
    fn send_email(&self, to: &str, code: &str) -> Result<()>;
    fn send_sms(&self, to: &str, code: &str) -> Result<()>;
}

/// Local dev sender that logs instead of delivering.
#[derive(Clone, Debug, Default)]
pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send_email(&self, to: &str, code: &str) -> Result<()> {
        info!(to_email = %to, %code, "mfa email send stub");
        Ok(())
    }

    fn send_sms(&self, to: &str, code: &str) -> Result<()> {
        info!(to_phone = %to, %code, "mfa sms send stub");
        Ok(())
    }
}

/// Ephemeral challenge state, never persisted beyond the login attempt.
struct Challenge {
    user_id: Uuid,
    org_id: Option<Uuid>,
    email: String,
    phone: Option<String>,
    methods: Vec<MfaMethod>,
    method: Option<MfaMethod>,
    code_hash: Option<Vec<u8>>,
    attempts: u32,
    last_sent_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct PendingEnrollment {
    secret_base32: String,
}

/// Opened challenge handed back to the login flow.
#[derive(Clone, Debug)]
pub struct MfaChallengeStart {
    pub access_token: String,
    pub methods: Vec<MfaMethod>,
}

#[derive(Clone, Debug)]
pub enum MfaCheckOutcome {
    /// Challenge is live and a code was issued (or the authenticator app is
    /// expected, in which case there is no delivery target).
    Ready {
        method: MfaMethod,
        masked_target: Option<String>,
    },
    InvalidToken,
}

#[derive(Clone, Debug)]
pub enum MfaResendOutcome {
    Sent { masked_target: String },
    /// Minimum resend interval not yet elapsed.
    Throttled,
    MethodNotAvailable,
    InvalidToken,
}

#[derive(Clone, Debug)]
pub enum MfaVerifyOutcome {
    Verified {
        user_id: Uuid,
        issued: IssuedSession,
        remember_token: Option<String>,
    },
    InvalidCode,
    /// Challenge missing or past its expiry.
    Expired,
    TooManyAttempts,
}

/// TOTP enrollment material shown once to the user.
#[derive(Clone, Debug)]
pub struct TotpSetup {
    pub secret_base32: String,
    pub provisioning_uri: String,
}

pub struct MfaController {
    store: Arc<dyn CredentialStore>,
    policy: SecurityPolicyEvaluator,
    sessions: SessionManager,
    sender: Arc<dyn CodeSender>,
    config: MfaConfig,
    challenges: ExpiringArena<Challenge>,
    trusted_devices: ExpiringArena<Uuid>,
    enrollments: ExpiringArena<PendingEnrollment>,
}

impl MfaController {
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        policy: SecurityPolicyEvaluator,
        sessions: SessionManager,
        sender: Arc<dyn CodeSender>,
        config: MfaConfig,
    ) -> Self {
        Self {
            store,
            policy,
            sessions,
            sender,
            config,
            challenges: ExpiringArena::new(),
            trusted_devices: ExpiringArena::new(),
            enrollments: ExpiringArena::new(),
        }
    }

    /// Open a challenge for a user whose primary credentials already
    /// verified. Returns the temporary access token and the methods the
    /// organization policy allows for this user.
    pub async fn begin_challenge(
        &self,
        user: &UserRecord,
    ) -> Result<MfaChallengeStart, ServiceError> {
        let methods = self.available_methods(user).await;
        let access_token = format!("{ACCESS_TOKEN_PREFIX}{}", generate_token()?);
        self.challenges
            .insert(
                access_token.clone(),
                Challenge {
                    user_id: user.id,
                    org_id: user.org_id,
                    email: user.email.clone(),
                    phone: user.phone.clone(),
                    methods: methods.clone(),
                    method: None,
                    code_hash: None,
                    attempts: 0,
                    last_sent_at: None,
                },
                Duration::seconds(self.config.challenge_ttl_seconds),
            )
            .await;
        Ok(MfaChallengeStart {
            access_token,
            methods,
        })
    }

    /// Methods the policy allows, narrowed to what the user can receive.
    /// Email is the fallback when the intersection would be empty, since a
    /// login identity always has a deliverable address.
    async fn available_methods(&self, user: &UserRecord) -> Vec<MfaMethod> {
        let allowed = self.policy.allowed_mfa_methods(user.org_id).await;
        let mut methods: Vec<MfaMethod> = allowed
            .into_iter()
            .filter(|method| match method {
                MfaMethod::Totp => user.totp_secret.is_some(),
                MfaMethod::Sms => user.phone.is_some(),
                MfaMethod::Email => true,
            })
            .collect();
        if methods.is_empty() {
            warn!(user_id = %user.id, "no allowed MFA method deliverable, falling back to email");
            methods.push(MfaMethod::Email);
        }
        methods
    }

    /// Select the factor and issue (or refresh) its challenge code.
    pub async fn check_requirements(
        &self,
        access_token: &str,
        preferred_method: Option<MfaMethod>,
    ) -> Result<MfaCheckOutcome, ServiceError> {
        let now = Utc::now();
        // Selection and code rotation happen under the arena lock; delivery
        // happens after it is released.
        let planned = self
            .challenges
            .update(access_token, |challenge| {
                let method = preferred_method
                    .filter(|m| challenge.methods.contains(m))
                    .or_else(|| challenge.methods.first().copied())?;
                challenge.method = Some(method);
                if method == MfaMethod::Totp {
                    return Some((method, None, None));
                }
                let code = generate_code();
                challenge.code_hash = Some(hash_token(&code));
                challenge.last_sent_at = Some(now);
                let target = match method {
                    MfaMethod::Email => challenge.email.clone(),
                    MfaMethod::Sms => challenge.phone.clone().unwrap_or_default(),
                    MfaMethod::Totp => unreachable!("handled above"),
                };
                Some((method, Some(code), Some(target)))
            })
            .await;

        let Some(Some((method, code, target))) = planned else {
            return Ok(MfaCheckOutcome::InvalidToken);
        };

        let masked_target = match (code, target) {
            (Some(code), Some(target)) => {
                self.deliver(method, &target, &code)?;
                Some(mask_target(method, &target))
            }
            _ => None,
        };
        Ok(MfaCheckOutcome::Ready {
            method,
            masked_target,
        })
    }

    /// Verify the submitted code. Attempt accounting is a single guarded
    /// update, so the cap cannot be bypassed by racing submissions.
    pub async fn verify_code(
        &self,
        access_token: &str,
        code: &str,
        remember_device: bool,
        context: &SessionContext,
    ) -> Result<MfaVerifyOutcome, ServiceError> {
        enum Attempt {
            Exhausted,
            Candidate {
                user_id: Uuid,
                org_id: Option<Uuid>,
                method: Option<MfaMethod>,
                code_hash: Option<Vec<u8>>,
            },
        }

        let max_attempts = self.config.max_attempts;
        let attempt = self
            .challenges
            .update(access_token, |challenge| {
                if challenge.attempts >= max_attempts {
                    return Attempt::Exhausted;
                }
                challenge.attempts += 1;
                Attempt::Candidate {
                    user_id: challenge.user_id,
                    org_id: challenge.org_id,
                    method: challenge.method,
                    code_hash: challenge.code_hash.clone(),
                }
            })
            .await;

        let (user_id, org_id, method, code_hash) = match attempt {
            None => return Ok(MfaVerifyOutcome::Expired),
            Some(Attempt::Exhausted) => return Ok(MfaVerifyOutcome::TooManyAttempts),
            Some(Attempt::Candidate {
                user_id,
                org_id,
                method,
                code_hash,
            }) => (user_id, org_id, method, code_hash),
        };

        let valid = match method {
            Some(MfaMethod::Totp) => {
                let user = self
                    .store
                    .find_user_by_id(user_id)
                    .await
                    .map_err(store_error)?;
                match user.and_then(|u| u.totp_secret) {
                    Some(secret) => totp_matches(&secret, code, &self.config.issuer, "login")?,
                    None => false,
                }
            }
            Some(MfaMethod::Email | MfaMethod::Sms) => code_hash
                .map(|hash| digests_match(&hash_token(code), &hash))
                .unwrap_or(false),
            // No method selected yet: nothing was issued to compare against.
            None => false,
        };

        if !valid {
            return Ok(MfaVerifyOutcome::InvalidCode);
        }

        // Consume the challenge before the session exists; a failure after
        // this point aborts the login rather than leaving a reusable code.
        self.challenges.take(access_token).await;

        let mut session_context = context.clone();
        session_context.org_id = session_context.org_id.or(org_id);
        let issued = self.sessions.create(user_id, &session_context).await?;

        let remember_token = if remember_device {
            match &context.device_id {
                Some(device_id) => {
                    self.trusted_devices
                        .insert(
                            trust_key(user_id, device_id),
                            user_id,
                            Duration::seconds(self.config.remember_device_ttl_seconds),
                        )
                        .await;
                    Some(device_id.clone())
                }
                None => None,
            }
        } else {
            None
        };

        Ok(MfaVerifyOutcome::Verified {
            user_id,
            issued,
            remember_token,
        })
    }

    /// Mint a fresh batch of recovery codes, replacing any previous batch.
    /// `None` when the user has no second factor to recover from.
    pub async fn generate_recovery_codes(
        &self,
        user: &UserRecord,
    ) -> Result<Option<Vec<String>>, ServiceError> {
        if !user.mfa_enabled {
            return Ok(None);
        }
        let batch = recovery::RecoveryCodeBatch::generate()?;
        self.store
            .replace_recovery_codes(user.id, &batch.code_hashes)
            .await
            .map_err(store_error)?;
        info!(user_id = %user.id, "recovery codes regenerated");
        Ok(Some(batch.codes))
    }

    /// Complete a challenge with a recovery code instead of a delivered or
    /// TOTP code. Shares the attempt cap with `verify_code`; a consumed code
    /// never verifies again, and no device trust is granted on this path.
    pub async fn verify_recovery_code(
        &self,
        access_token: &str,
        code: &str,
        context: &SessionContext,
    ) -> Result<MfaVerifyOutcome, ServiceError> {
        enum Attempt {
            Exhausted,
            Candidate { user_id: Uuid, org_id: Option<Uuid> },
        }

        let max_attempts = self.config.max_attempts;
        let attempt = self
            .challenges
            .update(access_token, |challenge| {
                if challenge.attempts >= max_attempts {
                    return Attempt::Exhausted;
                }
                challenge.attempts += 1;
                Attempt::Candidate {
                    user_id: challenge.user_id,
                    org_id: challenge.org_id,
                }
            })
            .await;

        let (user_id, org_id) = match attempt {
            None => return Ok(MfaVerifyOutcome::Expired),
            Some(Attempt::Exhausted) => return Ok(MfaVerifyOutcome::TooManyAttempts),
            Some(Attempt::Candidate { user_id, org_id }) => (user_id, org_id),
        };

        let Some(normalized) = recovery::normalize_code(code) else {
            return Ok(MfaVerifyOutcome::InvalidCode);
        };
        let stored = self
            .store
            .find_recovery_codes(user_id)
            .await
            .map_err(store_error)?;
        let Some(matched) = stored
            .iter()
            .find(|row| recovery::code_matches(&normalized, &row.code_hash))
        else {
            return Ok(MfaVerifyOutcome::InvalidCode);
        };
        // First caller wins; a raced replay of the same code stops here.
        if !self
            .store
            .consume_recovery_code(matched.id)
            .await
            .map_err(store_error)?
        {
            return Ok(MfaVerifyOutcome::InvalidCode);
        }

        self.challenges.take(access_token).await;

        let mut session_context = context.clone();
        session_context.org_id = session_context.org_id.or(org_id);
        let issued = self.sessions.create(user_id, &session_context).await?;
        info!(user_id = %user_id, "login completed with a recovery code");
        Ok(MfaVerifyOutcome::Verified {
            user_id,
            issued,
            remember_token: None,
        })
    }

    pub async fn resend_email_code(
        &self,
        access_token: &str,
    ) -> Result<MfaResendOutcome, ServiceError> {
        self.resend(access_token, MfaMethod::Email).await
    }

    pub async fn resend_sms_code(
        &self,
        access_token: &str,
    ) -> Result<MfaResendOutcome, ServiceError> {
        self.resend(access_token, MfaMethod::Sms).await
    }

    /// Replace the outstanding code, subject to the minimum resend interval.
    async fn resend(
        &self,
        access_token: &str,
        method: MfaMethod,
    ) -> Result<MfaResendOutcome, ServiceError> {
        enum Plan {
            Throttled,
            NotAvailable,
            Send { code: String, target: String },
        }

        let cooldown = Duration::seconds(self.config.resend_cooldown_seconds);
        let now = Utc::now();
        let plan = self
            .challenges
            .update(access_token, |challenge| {
                if !challenge.methods.contains(&method) {
                    return Plan::NotAvailable;
                }
                let target = match method {
                    MfaMethod::Email => challenge.email.clone(),
                    MfaMethod::Sms => match &challenge.phone {
                        Some(phone) => phone.clone(),
                        None => return Plan::NotAvailable,
                    },
                    MfaMethod::Totp => return Plan::NotAvailable,
                };
                if let Some(last) = challenge.last_sent_at {
                    if now - last < cooldown {
                        return Plan::Throttled;
                    }
                }
                let code = generate_code();
                challenge.method = Some(method);
                challenge.code_hash = Some(hash_token(&code));
                challenge.last_sent_at = Some(now);
                Plan::Send { code, target }
            })
            .await;

        match plan {
            None => Ok(MfaResendOutcome::InvalidToken),
            Some(Plan::Throttled) => Ok(MfaResendOutcome::Throttled),
            Some(Plan::NotAvailable) => Ok(MfaResendOutcome::MethodNotAvailable),
            Some(Plan::Send { code, target }) => {
                self.deliver(method, &target, &code)?;
                Ok(MfaResendOutcome::Sent {
                    masked_target: mask_target(method, &target),
                })
            }
        }
    }

    /// Whether this device earned a trust marker within the remember-device
    /// window. Non-consuming: the marker stays valid until it expires.
    pub async fn is_device_trusted(&self, user_id: Uuid, device_id: &str) -> bool {
        self.trusted_devices
            .contains(&trust_key(user_id, device_id))
            .await
    }

    /// Start TOTP enrollment for an already-authenticated user. The secret
    /// is held pending until one code verifies.
    pub async fn setup_totp(&self, user: &UserRecord) -> Result<TotpSetup, ServiceError> {
        let secret = Secret::generate_secret();
        let secret_base32 = secret.to_encoded().to_string();
        let totp = build_totp(&secret_base32, &self.config.issuer, &user.email)?;
        let provisioning_uri = totp.get_url();
        self.enrollments
            .insert(
                enrollment_key(user.id),
                PendingEnrollment {
                    secret_base32: secret_base32.clone(),
                },
                Duration::seconds(ENROLLMENT_TTL_SECONDS),
            )
            .await;
        Ok(TotpSetup {
            secret_base32,
            provisioning_uri,
        })
    }

    /// Finish enrollment: one successful code is required before "MFA
    /// enabled" is persisted. Returns false on an invalid code.
    pub async fn confirm_totp(&self, user: &UserRecord, code: &str) -> Result<bool, ServiceError> {
        let Some(pending) = self.enrollments.peek(&enrollment_key(user.id)).await else {
            return Ok(false);
        };
        if !totp_matches(&pending.secret_base32, code, &self.config.issuer, &user.email)? {
            return Ok(false);
        }
        self.enrollments.take(&enrollment_key(user.id)).await;
        self.store
            .set_mfa(user.id, true, Some(&pending.secret_base32))
            .await
            .map_err(store_error)?;
        info!(user_id = %user.id, "TOTP enrollment confirmed");
        Ok(true)
    }

    /// Disable MFA; requires a valid current code.
    pub async fn disable_totp(&self, user: &UserRecord, code: &str) -> Result<bool, ServiceError> {
        let Some(secret) = &user.totp_secret else {
            return Ok(false);
        };
        if !totp_matches(secret, code, &self.config.issuer, &user.email)? {
            return Ok(false);
        }
        self.store
            .set_mfa(user.id, false, None)
            .await
            .map_err(store_error)?;
        info!(user_id = %user.id, "MFA disabled");
        Ok(true)
    }

    fn deliver(&self, method: MfaMethod, target: &str, code: &str) -> Result<(), ServiceError> {
        let sent = match method {
            MfaMethod::Email => self.sender.send_email(target, code),
            MfaMethod::Sms => self.sender.send_sms(target, code),
            MfaMethod::Totp => Ok(()),
        };
        sent.map_err(|err| ServiceError::external_service(format!("code delivery failed: {err}")))
    }
}

fn trust_key(user_id: Uuid, device_id: &str) -> String {
    format!("trust:{user_id}:{device_id}")
}

fn enrollment_key(user_id: Uuid) -> String {
    format!("enroll:{user_id}")
}

/// Six-digit challenge code.
fn generate_code() -> String {
    format!("{:06}", OsRng.gen_range(0..1_000_000u32))
}

fn build_totp(secret_base32: &str, issuer: &str, account: &str) -> Result<TOTP, ServiceError> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|err| ServiceError::validation(format!("invalid TOTP secret: {err:?}")))?;
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|err| ServiceError::validation(format!("invalid TOTP parameters: {err}")))
}

fn totp_matches(
    secret_base32: &str,
    code: &str,
    issuer: &str,
    account: &str,
) -> Result<bool, ServiceError> {
    let totp = build_totp(secret_base32, issuer, account)?;
    totp.check_current(code)
        .map_err(|err| ServiceError::internal(&format!("system clock error: {err}")))
}

/// Mask the delivery target so the challenge response never leaks the full
/// address or number.
fn mask_target(method: MfaMethod, target: &str) -> String {
    match method {
        MfaMethod::Email => match target.split_once('@') {
            Some((local, domain)) => {
                let first = local.chars().next().unwrap_or('*');
                format!("{first}***@{domain}")
            }
            None => "***".to_string(),
        },
        MfaMethod::Sms => {
            let digits: String = target.chars().filter(char::is_ascii_digit).collect();
            let tail = if digits.len() >= 4 {
                &digits[digits.len() - 4..]
            } else {
                digits.as_str()
            };
            format!("***{tail}")
        }
        MfaMethod::Totp => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CodeSender, LogCodeSender, MfaCheckOutcome, MfaConfig, MfaController, MfaResendOutcome,
        MfaVerifyOutcome, build_totp, generate_code, mask_target, totp_matches,
    };
    use crate::policy::{MfaMethod, PolicyDocument, SecurityPolicyEvaluator};
    use crate::session::{SessionContext, SessionManager};
    use crate::store::{CredentialStore, MemoryStore, NewUser, UserRecord};
    use anyhow::Result;
    use std::sync::{Arc, Mutex};
    use totp_rs::Secret;
    use uuid::Uuid;

    /// Captures the last code instead of delivering it.
    #[derive(Default)]
    struct CapturingSender {
        last_code: Mutex<Option<String>>,
    }

    impl CodeSender for CapturingSender {
        fn send_email(&self, _to: &str, code: &str) -> Result<()> {
            *self.last_code.lock().expect("lock") = Some(code.to_string());
            Ok(())
        }

        fn send_sms(&self, _to: &str, code: &str) -> Result<()> {
            *self.last_code.lock().expect("lock") = Some(code.to_string());
            Ok(())
        }
    }

    impl CapturingSender {
        fn last(&self) -> Option<String> {
            self.last_code.lock().expect("lock").clone()
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        controller: MfaController,
        sender: Arc<CapturingSender>,
        user: UserRecord,
    }

    async fn fixture(config: MfaConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let policy = SecurityPolicyEvaluator::new(store.clone());
        let sessions = SessionManager::new(store.clone(), policy.clone());
        let sender = Arc::new(CapturingSender::default());
        let controller = MfaController::new(
            store.clone(),
            policy,
            sessions,
            sender.clone(),
            config,
        );
        let user = store
            .create_user(NewUser {
                email: "alice@example.com".to_string(),
                password_hash: "hash".to_string(),
                phone: Some("+15550001234".to_string()),
                org_id: None,
            })
            .await
            .expect("create user");
        Fixture {
            store,
            controller,
            sender,
            user,
        }
    }

    async fn issue_code(fixture: &Fixture, access_token: &str) -> String {
        let outcome = fixture
            .controller
            .check_requirements(access_token, Some(MfaMethod::Email))
            .await
            .expect("check");
        assert!(matches!(outcome, MfaCheckOutcome::Ready { .. }));
        fixture.sender.last().expect("code was sent")
    }

    #[tokio::test]
    async fn email_challenge_round_trip_creates_session() {
        let f = fixture(MfaConfig::new("custodia")).await;
        let start = f.controller.begin_challenge(&f.user).await.expect("begin");
        let code = issue_code(&f, &start.access_token).await;

        let outcome = f
            .controller
            .verify_code(&start.access_token, &code, false, &SessionContext::default())
            .await
            .expect("verify");
        let MfaVerifyOutcome::Verified { user_id, issued, .. } = outcome else {
            panic!("expected verification to succeed");
        };
        assert_eq!(user_id, f.user.id);
        assert!(!issued.token.is_empty());

        // The challenge is consumed; replaying the code fails.
        let replay = f
            .controller
            .verify_code(&start.access_token, &code, false, &SessionContext::default())
            .await
            .expect("replay");
        assert!(matches!(replay, MfaVerifyOutcome::Expired));
    }

    #[tokio::test]
    async fn wrong_code_is_a_business_failure() {
        let f = fixture(MfaConfig::new("custodia")).await;
        let start = f.controller.begin_challenge(&f.user).await.expect("begin");
        issue_code(&f, &start.access_token).await;
        let outcome = f
            .controller
            .verify_code(&start.access_token, "000000x", false, &SessionContext::default())
            .await
            .expect("verify");
        assert!(matches!(outcome, MfaVerifyOutcome::InvalidCode));
    }

    #[tokio::test]
    async fn attempt_cap_rejects_even_the_correct_code() {
        let f = fixture(MfaConfig::new("custodia").with_max_attempts(2)).await;
        let start = f.controller.begin_challenge(&f.user).await.expect("begin");
        let code = issue_code(&f, &start.access_token).await;

        for _ in 0..2 {
            let outcome = f
                .controller
                .verify_code(&start.access_token, "999999x", false, &SessionContext::default())
                .await
                .expect("verify");
            assert!(matches!(outcome, MfaVerifyOutcome::InvalidCode));
        }
        let outcome = f
            .controller
            .verify_code(&start.access_token, &code, false, &SessionContext::default())
            .await
            .expect("verify");
        assert!(matches!(outcome, MfaVerifyOutcome::TooManyAttempts));
    }

    #[tokio::test]
    async fn resend_is_throttled_within_cooldown() {
        let f = fixture(MfaConfig::new("custodia").with_resend_cooldown_seconds(3600)).await;
        let start = f.controller.begin_challenge(&f.user).await.expect("begin");
        issue_code(&f, &start.access_token).await;
        let outcome = f
            .controller
            .resend_email_code(&start.access_token)
            .await
            .expect("resend");
        assert!(matches!(outcome, MfaResendOutcome::Throttled));
    }

    #[tokio::test]
    async fn resend_replaces_the_code_after_cooldown() {
        let f = fixture(MfaConfig::new("custodia").with_resend_cooldown_seconds(0)).await;
        let start = f.controller.begin_challenge(&f.user).await.expect("begin");
        let first = issue_code(&f, &start.access_token).await;
        let outcome = f
            .controller
            .resend_email_code(&start.access_token)
            .await
            .expect("resend");
        let MfaResendOutcome::Sent { masked_target } = outcome else {
            panic!("expected resend to go through");
        };
        assert_eq!(masked_target, "a***@example.com");
        let second = f.sender.last().expect("second code");
        // The old code no longer verifies once replaced.
        if first != second {
            let outcome = f
                .controller
                .verify_code(&start.access_token, &first, false, &SessionContext::default())
                .await
                .expect("verify");
            assert!(matches!(outcome, MfaVerifyOutcome::InvalidCode));
        }
    }

    #[tokio::test]
    async fn remember_device_skips_future_challenges() {
        let f = fixture(MfaConfig::new("custodia")).await;
        let start = f.controller.begin_challenge(&f.user).await.expect("begin");
        let code = issue_code(&f, &start.access_token).await;
        let context = SessionContext {
            device_id: Some("device-1".to_string()),
            ..SessionContext::default()
        };
        let outcome = f
            .controller
            .verify_code(&start.access_token, &code, true, &context)
            .await
            .expect("verify");
        assert!(matches!(outcome, MfaVerifyOutcome::Verified { .. }));
        assert!(f.controller.is_device_trusted(f.user.id, "device-1").await);
        assert!(!f.controller.is_device_trusted(f.user.id, "device-2").await);
    }

    #[tokio::test]
    async fn totp_enrollment_requires_a_valid_code() {
        let f = fixture(MfaConfig::new("custodia")).await;
        let setup = f.controller.setup_totp(&f.user).await.expect("setup");
        assert!(setup.provisioning_uri.starts_with("otpauth://totp/"));

        // A non-numeric code can never match; enrollment stays pending.
        assert!(!f
            .controller
            .confirm_totp(&f.user, "not-a-code")
            .await
            .expect("confirm wrong"));

        let totp = build_totp(&setup.secret_base32, "custodia", &f.user.email).expect("totp");
        let code = totp.generate_current().expect("code");
        assert!(f
            .controller
            .confirm_totp(&f.user, &code)
            .await
            .expect("confirm"));
        let reloaded = f
            .store
            .find_user_by_id(f.user.id)
            .await
            .expect("find")
            .expect("user");
        assert!(reloaded.mfa_enabled);
        assert_eq!(reloaded.totp_secret, Some(setup.secret_base32));
    }

    #[tokio::test]
    async fn disable_requires_current_code() {
        let f = fixture(MfaConfig::new("custodia")).await;
        let secret = Secret::generate_secret().to_encoded().to_string();
        f.store
            .set_mfa(f.user.id, true, Some(&secret))
            .await
            .expect("enable");
        let user = f
            .store
            .find_user_by_id(f.user.id)
            .await
            .expect("find")
            .expect("user");

        assert!(!f
            .controller
            .disable_totp(&user, "not-a-code")
            .await
            .expect("disable wrong"));

        let totp = build_totp(&secret, "custodia", &user.email).expect("totp");
        let code = totp.generate_current().expect("code");
        assert!(f.controller.disable_totp(&user, &code).await.expect("disable"));
        let reloaded = f
            .store
            .find_user_by_id(f.user.id)
            .await
            .expect("find")
            .expect("user");
        assert!(!reloaded.mfa_enabled);
        assert_eq!(reloaded.totp_secret, None);
    }

    #[tokio::test]
    async fn sms_only_policy_uses_phone() {
        let f = fixture(MfaConfig::new("custodia")).await;
        let org_id = Uuid::new_v4();
        f.store
            .put_policy(
                org_id,
                PolicyDocument {
                    allowed_mfa_methods: Some(vec![MfaMethod::Sms]),
                    ..PolicyDocument::default()
                },
            )
            .await;
        let mut user = f.user.clone();
        user.org_id = Some(org_id);
        let start = f.controller.begin_challenge(&user).await.expect("begin");
        assert_eq!(start.methods, vec![MfaMethod::Sms]);
        let outcome = f
            .controller
            .check_requirements(&start.access_token, None)
            .await
            .expect("check");
        let MfaCheckOutcome::Ready {
            method,
            masked_target,
        } = outcome
        else {
            panic!("expected challenge to be ready");
        };
        assert_eq!(method, MfaMethod::Sms);
        assert_eq!(masked_target.as_deref(), Some("***1234"));
    }

    #[tokio::test]
    async fn recovery_codes_require_mfa_to_be_enabled() {
        let f = fixture(MfaConfig::new("custodia")).await;
        assert!(f
            .controller
            .generate_recovery_codes(&f.user)
            .await
            .expect("generate")
            .is_none());
    }

    #[tokio::test]
    async fn recovery_code_completes_a_challenge_exactly_once() {
        let f = fixture(MfaConfig::new("custodia")).await;
        let secret = Secret::generate_secret().to_encoded().to_string();
        f.store
            .set_mfa(f.user.id, true, Some(&secret))
            .await
            .expect("enable");
        let user = f
            .store
            .find_user_by_id(f.user.id)
            .await
            .expect("find")
            .expect("user");

        let codes = f
            .controller
            .generate_recovery_codes(&user)
            .await
            .expect("generate")
            .expect("codes");
        assert_eq!(codes.len(), 10);

        let start = f.controller.begin_challenge(&user).await.expect("begin");
        let outcome = f
            .controller
            .verify_recovery_code(&start.access_token, &codes[0], &SessionContext::default())
            .await
            .expect("verify");
        let MfaVerifyOutcome::Verified { user_id, issued, remember_token } = outcome else {
            panic!("expected the recovery code to verify");
        };
        assert_eq!(user_id, user.id);
        assert!(!issued.token.is_empty());
        assert_eq!(remember_token, None);

        // The same code on a fresh challenge is already burned.
        let again = f.controller.begin_challenge(&user).await.expect("begin");
        let replay = f
            .controller
            .verify_recovery_code(&again.access_token, &codes[0], &SessionContext::default())
            .await
            .expect("replay");
        assert!(matches!(replay, MfaVerifyOutcome::InvalidCode));
    }

    #[tokio::test]
    async fn regenerating_recovery_codes_invalidates_the_old_batch() {
        let f = fixture(MfaConfig::new("custodia")).await;
        let secret = Secret::generate_secret().to_encoded().to_string();
        f.store
            .set_mfa(f.user.id, true, Some(&secret))
            .await
            .expect("enable");
        let user = f
            .store
            .find_user_by_id(f.user.id)
            .await
            .expect("find")
            .expect("user");

        let old = f
            .controller
            .generate_recovery_codes(&user)
            .await
            .expect("first batch")
            .expect("codes");
        let fresh = f
            .controller
            .generate_recovery_codes(&user)
            .await
            .expect("second batch")
            .expect("codes");

        let start = f.controller.begin_challenge(&user).await.expect("begin");
        let stale = f
            .controller
            .verify_recovery_code(&start.access_token, &old[0], &SessionContext::default())
            .await
            .expect("stale");
        assert!(matches!(stale, MfaVerifyOutcome::InvalidCode));

        let outcome = f
            .controller
            .verify_recovery_code(&start.access_token, &fresh[0], &SessionContext::default())
            .await
            .expect("fresh");
        assert!(matches!(outcome, MfaVerifyOutcome::Verified { .. }));
    }

    #[tokio::test]
    async fn malformed_recovery_code_counts_as_an_attempt() {
        let f = fixture(MfaConfig::new("custodia").with_max_attempts(1)).await;
        let secret = Secret::generate_secret().to_encoded().to_string();
        f.store
            .set_mfa(f.user.id, true, Some(&secret))
            .await
            .expect("enable");
        let user = f
            .store
            .find_user_by_id(f.user.id)
            .await
            .expect("find")
            .expect("user");
        let codes = f
            .controller
            .generate_recovery_codes(&user)
            .await
            .expect("generate")
            .expect("codes");

        let start = f.controller.begin_challenge(&user).await.expect("begin");
        let garbage = f
            .controller
            .verify_recovery_code(&start.access_token, "nope", &SessionContext::default())
            .await
            .expect("garbage");
        assert!(matches!(garbage, MfaVerifyOutcome::InvalidCode));

        let outcome = f
            .controller
            .verify_recovery_code(&start.access_token, &codes[0], &SessionContext::default())
            .await
            .expect("capped");
        assert!(matches!(outcome, MfaVerifyOutcome::TooManyAttempts));
    }

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn mask_target_hides_identifiers() {
        assert_eq!(
            mask_target(MfaMethod::Email, "alice@example.com"),
            "a***@example.com"
        );
        assert_eq!(mask_target(MfaMethod::Sms, "+1 555 000 1234"), "***1234");
    }

    #[test]
    fn totp_matches_rejects_garbage_secret() {
        assert!(totp_matches("not base32!!", "000000", "custodia", "a@b.co").is_err());
    }

    #[test]
    fn log_sender_accepts_messages() {
        let sender = LogCodeSender;
        assert!(sender.send_email("a@example.com", "123456").is_ok());
        assert!(sender.send_sms("+15550001234", "123456").is_ok());
    }
}
