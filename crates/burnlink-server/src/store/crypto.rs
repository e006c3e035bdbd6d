use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce length for ChaCha20Poly1305.
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Secret used to derive the key when running with `BURNLINK_DEV_MODE=true`
/// and no key material is configured. Never valid outside development.
pub const DEV_SECRET: &str = "burnlink-dev-secret-key";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("encryption failed")]
    EncryptionFailed,

    /// Wrong key, truncated input, or tampered ciphertext.
    #[error("decryption failed")]
    DecryptionFailed,
}

/// 32-byte payload encryption key. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a direct key override given as 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut raw = hex::decode(s.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not hex: {e}")))?;
        if raw.len() != 32 {
            let len = raw.len();
            raw.zeroize();
            return Err(CryptoError::InvalidKey(format!(
                "expected 32 bytes, got {len}"
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Derive the payload key from configured secret material and a persisted
/// salt using Argon2id (64 MiB, 3 passes, 1 lane).
pub fn derive_key(secret: &str, salt: &[u8; 32]) -> Result<EncryptionKey, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::InvalidKey("secret key is empty".into()));
    }
    let params = Params::new(65536, 3, 1, Some(32))
        .map_err(|e| CryptoError::Derivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::Derivation(format!("argon2 hash: {e}")))?;
    Ok(EncryptionKey(key))
}

/// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a value produced by [`encrypt`].
pub fn decrypt(key: &EncryptionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Generate a fresh 32-byte random salt.
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Generate a random key. `burnlink keygen` prints one as hex.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}
