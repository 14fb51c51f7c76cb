//! Cryptographic primitives for the gearshed auth adapters.
//!
//! This module provides:
//! - Password hashing using Argon2id (PHC strings)
//! - Signed id tokens using keyed BLAKE2b
//! - Sealed session cookies using XChaCha20-Poly1305
//! - Key material with automatic zeroization
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No password, token or key material is ever logged
//! - Tag comparison is constant-time

pub mod aead;
pub mod keys;
pub mod password;
pub mod token;

pub use aead::{validate_cookie_lifetime, CookieSealer, MAX_SESSION_COOKIE_LIFETIME, MIN_SESSION_COOKIE_LIFETIME};
pub use keys::{SigningKey, KEY_LENGTH};
pub use password::{hash_password, validate_password, verify_password, MIN_PASSWORD_LENGTH};
pub use token::{TokenClaims, TokenSigner, ID_TOKEN_LIFETIME_SECS};
