//! Custodia: authentication, session, and request-security service.
//!
//! The crate is organized leaves-first:
//!
//! - [`store`]: the `CredentialStore` data-provider trait plus Postgres and
//!   in-memory implementations.
//! - [`policy`]: per-organization security policy defaults, merging, and the
//!   `SecurityPolicyEvaluator`.
//! - [`csrf`]: stateless double-submit CSRF middleware.
//! - [`session`]: session lifecycle (create/refresh/revoke/list) with
//!   policy-driven caps and timeouts.
//! - [`mfa`]: second-factor orchestration (TOTP, SMS, email codes) and
//!   single-use recovery codes.
//! - [`oauth`]: provider authorization URLs and code exchange.
//! - [`auth`]: the `AuthService` state machine composing everything above.
//! - [`api`]: the axum HTTP surface.
//!
//! Services are constructed once at startup and threaded through request
//! extensions; there is no global registry.

pub mod api;
pub mod arena;
pub mod auth;
pub mod cli;
pub mod csrf;
pub mod error;
pub mod mfa;
pub mod oauth;
pub mod policy;
pub mod session;
pub mod store;
pub(crate) mod token;

pub use error::{ErrorKind, ServiceError};
