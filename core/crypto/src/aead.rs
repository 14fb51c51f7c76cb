//! Session cookie sealing using XChaCha20-Poly1305.
//!
//! A session cookie is the token claims, encrypted and authenticated with a
//! key only the server side holds. The 24-byte nonce is safe for random
//! generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};
use std::time::Duration;

use crate::keys::SigningKey;
use crate::token::TokenClaims;
use gearshed_common::{AuthErrorCode, Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Shortest session cookie lifetime accepted.
pub const MIN_SESSION_COOKIE_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Longest session cookie lifetime accepted.
pub const MAX_SESSION_COOKIE_LIFETIME: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Check a requested session cookie lifetime.
pub fn validate_cookie_lifetime(expires_in: Duration) -> Result<()> {
    if expires_in < MIN_SESSION_COOKIE_LIFETIME || expires_in > MAX_SESSION_COOKIE_LIFETIME {
        return Err(Error::auth(
            AuthErrorCode::InvalidSessionCookieDuration,
            "Session cookie lifetime must be between 5 minutes and 14 days",
        ));
    }
    Ok(())
}

/// Seals and opens session cookies.
pub struct CookieSealer {
    key: SigningKey,
}

impl CookieSealer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Encrypt `claims` into a cookie value.
    ///
    /// # Postconditions
    /// - Returns base64url(nonce || ciphertext || tag)
    /// - The nonce is randomly generated
    pub fn seal(&self, claims: &TokenClaims) -> Result<String> {
        let plaintext = serde_json::to_vec(claims)?;
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(self.key.as_bytes()));
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Decrypt a cookie value and check its expiry against `now` (unix seconds).
    ///
    /// # Errors
    /// - `auth/invalid-session-cookie` when malformed, tampered or sealed with another key
    /// - `auth/session-cookie-expired` when past its expiry
    pub fn open(&self, cookie: &str, now: i64) -> Result<TokenClaims> {
        let invalid = || {
            Error::auth(
                AuthErrorCode::InvalidSessionCookie,
                "Session cookie is invalid",
            )
        };

        let sealed = URL_SAFE_NO_PAD.decode(cookie).map_err(|_| invalid())?;
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(invalid());
        }

        let (nonce_bytes, encrypted) = sealed.split_at(NONCE_SIZE);
        let nonce = GenericArray::from_slice(nonce_bytes);
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(self.key.as_bytes()));

        let plaintext = cipher.decrypt(nonce, encrypted).map_err(|_| invalid())?;
        let claims: TokenClaims = serde_json::from_slice(&plaintext).map_err(|_| invalid())?;

        if claims.exp <= now {
            return Err(Error::auth(
                AuthErrorCode::SessionCookieExpired,
                "Session cookie has expired",
            ));
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> TokenClaims {
        TokenClaims {
            iss: "project-a".to_string(),
            sub: "user-1".to_string(),
            email: None,
            email_verified: true,
            iat: 100,
            exp: 10_000,
            auth_time: 100,
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let sealer = CookieSealer::new(SigningKey::generate());
        let cookie = sealer.seal(&claims()).unwrap();
        assert_eq!(sealer.open(&cookie, 500).unwrap(), claims());
    }

    #[test]
    fn test_different_nonce_each_time() {
        let sealer = CookieSealer::new(SigningKey::generate());
        assert_ne!(sealer.seal(&claims()).unwrap(), sealer.seal(&claims()).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealer = CookieSealer::new(SigningKey::generate());
        let other = CookieSealer::new(SigningKey::generate());
        let cookie = sealer.seal(&claims()).unwrap();
        let err = other.open(&cookie, 500).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidSessionCookie));
    }

    #[test]
    fn test_expired_cookie() {
        let sealer = CookieSealer::new(SigningKey::generate());
        let cookie = sealer.seal(&claims()).unwrap();
        let err = sealer.open(&cookie, 10_000).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::SessionCookieExpired));
    }

    #[test]
    fn test_tampered_cookie_fails() {
        let sealer = CookieSealer::new(SigningKey::generate());
        let cookie = sealer.seal(&claims()).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&cookie).unwrap();
        raw[NONCE_SIZE + 3] ^= 0xFF;
        assert!(sealer.open(&URL_SAFE_NO_PAD.encode(raw), 500).is_err());
    }

    #[test]
    fn test_cookie_lifetime_bounds() {
        assert!(validate_cookie_lifetime(Duration::from_secs(60)).is_err());
        assert!(validate_cookie_lifetime(Duration::from_secs(3600)).is_ok());
        assert!(validate_cookie_lifetime(MAX_SESSION_COOKIE_LIFETIME).is_ok());
        assert!(validate_cookie_lifetime(MAX_SESSION_COOKIE_LIFETIME + Duration::from_secs(1)).is_err());
    }
}
