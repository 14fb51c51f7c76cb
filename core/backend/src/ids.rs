//! Document id generation.

use uuid::Uuid;

/// Length of generated document ids.
pub const AUTO_ID_LENGTH: usize = 20;

const ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

// Largest multiple of the alphabet size below 256; bytes above it are
// rejected so every character is equally likely.
const ACCEPT_BELOW: u8 = 248;

/// A random 20 character id over `[A-Za-z0-9]`.
pub fn auto_id() -> String {
    let mut id = String::with_capacity(AUTO_ID_LENGTH);
    while id.len() < AUTO_ID_LENGTH {
        let bytes = Uuid::new_v4().into_bytes();
        // Bytes 6 and 8 carry the uuid version and variant bits.
        for (i, byte) in bytes.iter().enumerate() {
            if i == 6 || i == 8 || *byte >= ACCEPT_BELOW {
                continue;
            }
            id.push(ALPHABET[(*byte as usize) % ALPHABET.len()] as char);
            if id.len() == AUTO_ID_LENGTH {
                break;
            }
        }
    }
    id
}
