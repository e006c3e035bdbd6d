//! Link identifiers.
//!
//! An id is 16 bytes from the OS CSPRNG rendered as unpadded URL-safe
//! base64. It carries no timestamp or counter, so ids reveal nothing about
//! creation order.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Random bytes per id (128 bits of entropy).
pub const ID_BYTES: usize = 16;

/// Encoded length of an id.
pub const ID_LEN: usize = 22;

pub fn generate() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Cheap syntactic check so garbage never reaches storage or the filesystem.
pub fn is_well_formed(id: &str) -> bool {
    id.len() == ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Leading characters of an id, for logs. A full id is a bearer credential.
pub fn fingerprint(id: &str) -> &str {
    id.get(..6).unwrap_or(id)
}
