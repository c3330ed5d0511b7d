//! AEAD encryption and key derivation for tokens at rest.
//!
//! Blob layout is `nonce ‖ ciphertext ‖ tag`: a 12-byte random nonce
//! followed by the AES-256-GCM output (which carries the 16-byte auth tag
//! at its end). Key derivation is PBKDF2-HMAC-SHA256.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{AuthError, Result};

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Minimum key material length in bytes. Longer keys are truncated to 32.
pub const MIN_KEY_SIZE: usize = 32;

/// Encrypt `plaintext` with AES-256-GCM under the first 32 bytes of `key`.
///
/// The returned blob is `nonce ‖ ciphertext ‖ tag` with a fresh random
/// nonce per call.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(AuthError::invalid_config("plaintext must not be empty"));
    }
    if key.len() < MIN_KEY_SIZE {
        return Err(AuthError::invalid_config(format!(
            "encryption key must be at least {MIN_KEY_SIZE} bytes, got {}",
            key.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(&key[..MIN_KEY_SIZE])
        .map_err(|e| AuthError::encryption(format!("cipher init failed: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| AuthError::encryption(format!("encryption failed: {e}")))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Fails with an encryption error when the blob is too short to carry a
/// nonce, when AEAD verification fails, or when the key is too short.
pub fn decrypt(blob: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() < MIN_KEY_SIZE {
        return Err(AuthError::encryption(format!(
            "decryption key must be at least {MIN_KEY_SIZE} bytes, got {}",
            key.len()
        )));
    }
    if blob.len() < NONCE_SIZE {
        return Err(AuthError::encryption(
            "ciphertext too short to contain a nonce",
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(&key[..MIN_KEY_SIZE])
        .map_err(|e| AuthError::encryption(format!("cipher init failed: {e}")))?;

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| AuthError::encryption("AEAD verification failed"))
}

/// Derive key material from a password with PBKDF2-HMAC-SHA256.
///
/// Deterministic for a given `(password, salt, iterations, key_length)`
/// tuple, so the same config always reopens the same store.
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32, key_length: usize) -> Vec<u8> {
    let mut key = vec![0u8; key_length];
    pbkdf2_hmac::<Sha256>(password, salt, iterations.max(1), &mut key);
    key
}

/// Generate `n` cryptographically random bytes, URL-safe base64 encoded
/// without padding.
pub fn generate_secure_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(&bytes)
}
