//! OpenAPI document for the HTTP surface, generated from the
//! `#[utoipa::path]` annotations on the handlers.

use utoipa::OpenApi;

use super::handlers::{auth, health, mfa, oauth, session};
use super::types;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "custodia",
        description = "Authentication, session, and request-security API"
    ),
    paths(
        health::health,
        auth::login,
        auth::register,
        auth::logout,
        auth::refresh,
        auth::send_magic_link,
        auth::verify_magic_link,
        auth::verify_email,
        auth::resend_verification,
        auth::request_password_reset,
        auth::confirm_password_reset,
        auth::update_password,
        mfa::check,
        mfa::verify,
        mfa::resend,
        oauth::authorize,
        oauth::callback,
        session::list,
        session::revoke_all,
    ),
    components(schemas(
        types::LoginRequest,
        types::RegisterRequest,
        types::EmailRequest,
        types::TokenRequest,
        types::ResetConfirmRequest,
        types::UpdatePasswordRequest,
        types::MfaCheckRequest,
        types::MfaVerifyRequest,
        types::MfaResendRequest,
        types::AuthResponse,
        types::UserBody,
        types::SessionBody,
        types::SessionsResponse,
        types::RevokeAllResponse,
        types::Health,
    )),
    tags(
        (name = "auth", description = "Login, registration, and credential flows"),
        (name = "mfa", description = "Second-factor challenges"),
        (name = "oauth", description = "External identity providers"),
        (name = "session", description = "Session listing and revocation"),
        (name = "health", description = "Service health")
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[cfg(test)]
mod tests {
    use super::openapi;

    #[test]
    fn document_covers_the_advertised_routes() {
        let doc = openapi();
        for path in [
            "/health",
            "/auth/login",
            "/auth/register",
            "/auth/logout",
            "/auth/verify-email",
            "/auth/verify-email/resend",
            "/auth/mfa/check",
            "/auth/mfa/verify",
            "/auth/mfa/resend",
            "/auth/oauth/{provider}/authorize",
            "/auth/oauth/{provider}/callback",
            "/session",
        ] {
            assert!(
                doc.paths.paths.contains_key(path),
                "missing path: {path}"
            );
        }
    }

    #[test]
    fn document_includes_timestamped_schemas() {
        let doc = openapi();
        let components = doc.components.expect("components");
        for schema in ["UserBody", "SessionBody", "SessionsResponse"] {
            assert!(
                components.schemas.contains_key(schema),
                "missing schema: {schema}"
            );
        }
    }
}
