//! Message sealing using `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use super::step::MessageKey;
use crate::error::ChainError;

/// Size of the random suffix in the nonce (12 bytes)
pub const NONCE_RANDOM_SIZE: usize = 12;

/// Encrypt `plaintext` under a message key, binding `associated_data`.
///
/// Returns ciphertext with the 16-byte Poly1305 tag appended.
///
/// # Security
///
/// - Nonce must be unique per key; [`build_nonce`] guarantees this for
///   message keys because each key is used once
/// - The associated data (message header) is authenticated but not encrypted
pub fn encrypt_with_key(
    message_key: &MessageKey,
    nonce: &[u8; 24],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let payload = Payload { msg: plaintext, aad: associated_data };
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt and authenticate a ciphertext sealed by [`encrypt_with_key`].
///
/// # Errors
///
/// - `DecryptionFailed`: If authentication tag, key or associated data do
///   not match (tamper)
pub fn decrypt_with_key(
    message_key: &MessageKey,
    nonce: &[u8; 24],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, ChainError> {
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let payload = Payload { msg: ciphertext, aad: associated_data };
    cipher.decrypt(XNonce::from_slice(nonce), payload).map_err(|_| ChainError::DecryptionFailed {
        reason: "authentication failed".to_string(),
    })
}

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-3: connection id (big-endian)
/// - bytes 4-7: ratchet epoch (big-endian)
/// - bytes 8-11: message index (big-endian)
/// - bytes 12-23: random suffix (caller-provided)
pub fn build_nonce(
    connect_id: u32,
    epoch: u32,
    index: u32,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..4].copy_from_slice(&connect_id.to_be_bytes());
    nonce[4..8].copy_from_slice(&epoch.to_be_bytes());
    nonce[8..12].copy_from_slice(&index.to_be_bytes());
    nonce[12..24].copy_from_slice(&random_suffix);
    nonce
}
