//! Password hashing using Argon2id.
//!
//! Hashes are stored as PHC strings so the parameters travel with the hash.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use gearshed_common::{AuthErrorCode, Error, Result};

/// Minimum accepted password length.
pub const MIN_PASSWORD_LENGTH: usize = 6;

/// Reject passwords the auth services would refuse.
pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(Error::auth(
            AuthErrorCode::WeakPassword,
            format!(
                "Password should be at least {} characters",
                MIN_PASSWORD_LENGTH
            ),
        ));
    }
    Ok(())
}

/// Hash a password into a PHC string.
///
/// # Errors
/// - Password too short
/// - Argon2 failure
pub fn hash_password(password: &str) -> Result<String> {
    validate_password(password)?;

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::Crypto(format!("Password hashing failed: {}", e)))?;

    Ok(hash.to_string())
}

/// Check a password against a stored PHC string.
///
/// # Returns
/// - `Ok(true)` if the password matches
/// - `Ok(false)` if it does not
/// - `Err(_)` if the stored hash is malformed
pub fn verify_password(password: &str, phc: &str) -> Result<bool> {
    let parsed = PasswordHash::new(phc)
        .map_err(|e| Error::Crypto(format!("Stored password hash is malformed: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let phc = hash_password("correct horse").unwrap();
        assert!(phc.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &phc).unwrap());
        assert!(!verify_password("wrong horse", &phc).unwrap());
    }

    #[test]
    fn test_hash_is_salted() {
        let a = hash_password("same-password").unwrap();
        let b = hash_password("same-password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_weak_password_rejected() {
        let err = hash_password("abc").unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::WeakPassword));
    }

    #[test]
    fn test_malformed_hash_errors() {
        assert!(verify_password("whatever", "not-a-phc-string").is_err());
    }
}
