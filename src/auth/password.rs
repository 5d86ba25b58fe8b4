//! Password hashing: PBKDF2-SHA256 with a per-account random salt, stored as a
//! PHC string (`$pbkdf2-sha256$i=…,l=32$salt$hash`) so the round count travels
//! with each hash and can be raised without breaking existing accounts.

use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::{Params, Pbkdf2};
use rand::RngCore;
use std::sync::OnceLock;

use crate::error::{ApiError, ApiResult};

/// Salt byte length before base64 encoding.
const SALT_BYTES: usize = 16;

/// Derived key length in bytes.
const OUTPUT_LEN: usize = 32;

/// Hash `password` with a fresh salt.
pub fn hash_password(password: &str, rounds: u32) -> ApiResult<String> {
    let mut salt_bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| ApiError::internal(format!("salt encoding: {e}")))?;

    let params = Params {
        rounds,
        output_length: OUTPUT_LEN,
    };
    let hash = Pbkdf2
        .hash_password_customized(password.as_bytes(), None, None, params, &salt)
        .map_err(|e| ApiError::internal(format!("password hashing: {e}")))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored PHC string. The digest comparison is
/// constant-time; a malformed stored hash never verifies.
pub fn verify_password(password: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Pbkdf2.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "stored password hash is malformed");
            false
        }
    }
}

/// Run a full verification against a throwaway hash so that a login for an
/// unknown email costs about as much as one with a wrong password.
pub fn dummy_verify(password: &str, rounds: u32) {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    let dummy = DUMMY.get_or_init(|| hash_password("mindhaven-dummy-password", rounds).ok());
    if let Some(phc) = dummy {
        let _ = verify_password(password, phc);
    }
}
