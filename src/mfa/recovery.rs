//! Single-use recovery codes, the fallback second factor when the
//! authenticator app or phone is unavailable.
//!
//! Codes are generated in batches and shown to the user exactly once; only
//! their Argon2 hashes are persisted. Generating a new batch invalidates
//! every code from the previous one.

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand::{RngCore, rngs::OsRng};

use crate::error::ServiceError;

pub const RECOVERY_CODE_COUNT: usize = 10;
const CODE_LEN: usize = 12;
const GROUP_SIZE: usize = 4;
// No 0/O or 1/I; the codes get read back from paper.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A freshly generated batch: plaintext codes for the one-time display,
/// hashes for the store.
#[derive(Debug)]
pub struct RecoveryCodeBatch {
    pub codes: Vec<String>,
    pub code_hashes: Vec<String>,
}

impl RecoveryCodeBatch {
    pub fn generate() -> Result<Self, ServiceError> {
        let mut rng = OsRng;
        let mut codes = Vec::with_capacity(RECOVERY_CODE_COUNT);
        let mut code_hashes = Vec::with_capacity(RECOVERY_CODE_COUNT);
        for _ in 0..RECOVERY_CODE_COUNT {
            let code = generate_code(&mut rng);
            code_hashes.push(hash_code(&code)?);
            codes.push(format_code(&code));
        }
        Ok(Self { codes, code_hashes })
    }
}

/// Strip separators and case from user input. `None` means the input cannot
/// be a recovery code at all.
#[must_use]
pub fn normalize_code(input: &str) -> Option<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    (normalized.len() == CODE_LEN
        && normalized.as_bytes().iter().all(|ch| ALPHABET.contains(ch)))
    .then_some(normalized)
}

/// Group a normalized code for display: `ABCD-EFGH-JKLM`.
#[must_use]
pub fn format_code(normalized: &str) -> String {
    normalized
        .as_bytes()
        .chunks(GROUP_SIZE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Check a normalized code against one stored hash.
#[must_use]
pub fn code_matches(normalized: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(normalized.as_bytes(), &parsed)
            .is_ok()
    })
}

fn generate_code<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut raw = [0u8; CODE_LEN];
    rng.fill_bytes(&mut raw);
    raw.iter()
        .map(|byte| ALPHABET[usize::from(*byte) % ALPHABET.len()] as char)
        .collect()
}

fn hash_code(normalized: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(normalized.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ServiceError::internal(&format!("recovery code hashing failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::{RECOVERY_CODE_COUNT, RecoveryCodeBatch, code_matches, format_code, normalize_code};

    #[test]
    fn normalize_strips_separators_and_case() {
        assert_eq!(
            normalize_code("abcd-efgh-jklm").as_deref(),
            Some("ABCDEFGHJKLM")
        );
        assert_eq!(
            normalize_code(" ABCD EFGH JKLM ").as_deref(),
            Some("ABCDEFGHJKLM")
        );
    }

    #[test]
    fn normalize_rejects_wrong_shape() {
        // Too short, ambiguous characters, empty.
        assert_eq!(normalize_code("ABCD-EFGH"), None);
        assert_eq!(normalize_code("ABCD-EFGH-JKL0"), None);
        assert_eq!(normalize_code(""), None);
    }

    #[test]
    fn format_groups_by_four() {
        assert_eq!(format_code("ABCDEFGHJKLM"), "ABCD-EFGH-JKLM");
    }

    #[test]
    fn batch_codes_verify_against_their_own_hash_only() {
        let batch = RecoveryCodeBatch::generate().expect("generate");
        assert_eq!(batch.codes.len(), RECOVERY_CODE_COUNT);
        assert_eq!(batch.code_hashes.len(), RECOVERY_CODE_COUNT);

        let first = normalize_code(&batch.codes[0]).expect("normalize");
        assert!(code_matches(&first, &batch.code_hashes[0]));
        assert!(!code_matches(&first, &batch.code_hashes[1]));
        assert!(!code_matches("ABCDEFGH9999", &batch.code_hashes[0]));
    }
}
