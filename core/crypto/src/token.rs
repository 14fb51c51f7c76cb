//! Signed id tokens.
//!
//! Format: `v1.<base64url(claims json)>.<base64url(tag)>` where the tag is a
//! keyed BLAKE2b over the first two parts.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::keys::SigningKey;
use gearshed_common::{AuthErrorCode, Error, Result};

/// Lifetime of a freshly minted id token.
pub const ID_TOKEN_LIFETIME_SECS: i64 = 3600;

const TOKEN_VERSION: &str = "v1";

/// Claims carried by id tokens and session cookies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer: the project the token belongs to.
    pub iss: String,
    /// Subject: the user id.
    pub sub: String,
    pub email: Option<String>,
    pub email_verified: bool,
    /// Issued at, unix seconds.
    pub iat: i64,
    /// Expires at, unix seconds.
    pub exp: i64,
    /// Time of the sign-in that started this session, unix seconds.
    pub auth_time: i64,
}

/// Mints and verifies id tokens for one issuer.
pub struct TokenSigner {
    key: SigningKey,
    issuer: String,
}

impl TokenSigner {
    pub fn new(key: SigningKey, issuer: impl Into<String>) -> Self {
        Self {
            key,
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Mint a token for `claims`.
    pub fn mint(&self, claims: &TokenClaims) -> Result<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signed = format!("{}.{}", TOKEN_VERSION, payload);
        let tag = URL_SAFE_NO_PAD.encode(self.key.tag(signed.as_bytes()));
        Ok(format!("{}.{}", signed, tag))
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    /// - `auth/argument-error` when malformed, tampered or from another issuer
    /// - `auth/id-token-expired` when `now` is past the expiry
    pub fn verify(&self, token: &str, now: i64) -> Result<TokenClaims> {
        let malformed = || Error::auth(AuthErrorCode::InvalidIdToken, "Id token is malformed");

        let (signed, tag) = token.rsplit_once('.').ok_or_else(malformed)?;
        let (version, payload) = signed.split_once('.').ok_or_else(malformed)?;
        if version != TOKEN_VERSION {
            return Err(malformed());
        }

        let tag = URL_SAFE_NO_PAD.decode(tag).map_err(|_| malformed())?;
        let expected = self.key.tag(signed.as_bytes());
        if !bool::from(expected.as_slice().ct_eq(&tag)) {
            return Err(Error::auth(
                AuthErrorCode::InvalidIdToken,
                "Id token signature does not verify",
            ));
        }

        let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| malformed())?;
        let claims: TokenClaims = serde_json::from_slice(&bytes).map_err(|_| malformed())?;

        if claims.iss != self.issuer {
            return Err(Error::auth(
                AuthErrorCode::InvalidIdToken,
                format!("Id token was issued by '{}'", claims.iss),
            ));
        }
        if claims.exp <= now {
            return Err(Error::auth(
                AuthErrorCode::IdTokenExpired,
                "Id token has expired",
            ));
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp: i64) -> TokenClaims {
        TokenClaims {
            iss: "project-a".to_string(),
            sub: "user-1".to_string(),
            email: Some("rider@example.com".to_string()),
            email_verified: false,
            iat: 1_000,
            exp,
            auth_time: 1_000,
        }
    }

    #[test]
    fn test_mint_and_verify() {
        let signer = TokenSigner::new(SigningKey::generate(), "project-a");
        let token = signer.mint(&claims(5_000)).unwrap();
        let verified = signer.verify(&token, 2_000).unwrap();
        assert_eq!(verified, claims(5_000));
    }

    #[test]
    fn test_expired_token() {
        let signer = TokenSigner::new(SigningKey::generate(), "project-a");
        let token = signer.mint(&claims(5_000)).unwrap();
        let err = signer.verify(&token, 5_000).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::IdTokenExpired));
    }

    #[test]
    fn test_foreign_key_rejected() {
        let signer = TokenSigner::new(SigningKey::generate(), "project-a");
        let other = TokenSigner::new(SigningKey::generate(), "project-a");
        let token = other.mint(&claims(5_000)).unwrap();
        let err = signer.verify(&token, 2_000).unwrap_err();
        assert_eq!(err.auth_code(), Some(AuthErrorCode::InvalidIdToken));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signer = TokenSigner::new(SigningKey::generate(), "project-a");
        let token = signer.mint(&claims(5_000)).unwrap();

        let mut forged = claims(5_000);
        forged.sub = "admin".to_string();
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let parts: Vec<&str> = token.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);

        assert!(signer.verify(&tampered, 2_000).is_err());
        assert!(signer.verify("garbage", 2_000).is_err());
    }
}
