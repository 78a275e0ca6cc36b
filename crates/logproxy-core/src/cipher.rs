//! Credential cipher for secrets stored in the configuration file.
//!
//! Ciphertext is hex of `nonce(12) || AES-256-GCM(plaintext)`, with the key
//! derived as SHA-256 of a passphrase.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Passphrase used when the configuration does not set `cipher_key`.
pub const DEFAULT_KEY: &str = "logproxy-default-credential-key";

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CipherError {
    #[error("ciphertext is not valid hex: {0}")]
    InvalidHex(String),

    #[error("ciphertext is too short")]
    TooShort,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    #[error("decrypted text is not valid UTF-8")]
    InvalidUtf8,
}

fn cipher_for(passphrase: &str) -> Result<Aes256Gcm, CipherError> {
    let key = Sha256::digest(passphrase.as_bytes());
    Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::EncryptionFailed)
}

/// Encrypts `plaintext` and returns lowercase hex.
pub fn encrypt(passphrase: &str, plaintext: &str) -> Result<String, CipherError> {
    let cipher = cipher_for(passphrase)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(hex::encode(out))
}

/// Decrypts hex produced by [`encrypt`].
pub fn decrypt(passphrase: &str, ciphertext_hex: &str) -> Result<String, CipherError> {
    let raw = hex::decode(ciphertext_hex.trim()).map_err(|e| CipherError::InvalidHex(e.to_string()))?;
    if raw.len() <= NONCE_LEN {
        return Err(CipherError::TooShort);
    }
    let (nonce, sealed) = raw.split_at(NONCE_LEN);

    let plain = cipher_for(passphrase)?
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CipherError::DecryptionFailed)?;

    String::from_utf8(plain).map_err(|_| CipherError::InvalidUtf8)
}
