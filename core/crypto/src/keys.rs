//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chacha20poly1305::{
    aead::{KeyInit, OsRng},
    XChaCha20Poly1305,
};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use gearshed_common::{Error, Result};

/// Length of signing and sealing keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Symmetric key used to sign id tokens and seal session cookies.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey {
    key: [u8; KEY_LENGTH],
}

impl SigningKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Generate a random key from the operating system RNG.
    pub fn generate() -> Self {
        let generated = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&generated);
        Self { key }
    }

    /// Derive a key from a configured secret and a purpose label.
    ///
    /// The same secret and purpose always yield the same key, so every
    /// process holding the secret agrees on it.
    ///
    /// # Errors
    /// - `secret` is empty
    pub fn from_secret(secret: &str, purpose: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Crypto("Key secret cannot be empty".to_string()));
        }

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(secret.as_bytes());
        hasher.update(purpose);

        let result = hasher.finalize();
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&result);
        Ok(Self { key })
    }

    /// Derive a subkey for a different purpose.
    pub fn derive(&self, purpose: &[u8]) -> SigningKey {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(purpose);
        hasher.update(b"subkey");

        let result = hasher.finalize();
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&result);
        SigningKey { key }
    }

    /// Keyed BLAKE2b tag over `data`.
    pub fn tag(&self, data: &[u8]) -> [u8; KEY_LENGTH] {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(data);

        let result = hasher.finalize();
        let mut tag = [0u8; KEY_LENGTH];
        tag.copy_from_slice(&result);
        tag
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey([REDACTED])")
    }
}
