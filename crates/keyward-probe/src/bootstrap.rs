//! Pre-session bootstrap.
//!
//! Before a session exists the X3DH initial message travels sealed to the
//! endpoint's bootstrap key. The sealed box has a small plaintext ceiling, so
//! the CBOR-encoded message goes through the chunked codec.

use keyward_crypto::{
    ChunkDecryptor, CodecError, InitialMessage, SEALED_BOX_CIPHERTEXT_CHUNK, SealedBoxDecryptor,
    SealedBoxEncryptor, decrypt_chunked, encrypt_chunked,
};
use rand::{CryptoRng, RngCore};
use thiserror::Error;

/// Bootstrap errors.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Initial message could not be encoded
    #[error("failed to encode initial message: {0}")]
    Encode(String),

    /// Initial message could not be decoded
    #[error("failed to decode initial message: {0}")]
    Decode(String),

    /// Chunked sealing or opening failed
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Seal `message` for the holder of `recipient`'s secret key.
pub fn seal<R: RngCore + CryptoRng>(
    recipient: &SealedBoxEncryptor,
    message: &InitialMessage,
    rng: &mut R,
) -> Result<Vec<u8>, BootstrapError> {
    let mut encoded = Vec::new();
    ciborium::into_writer(message, &mut encoded)
        .map_err(|e| BootstrapError::Encode(e.to_string()))?;
    Ok(encrypt_chunked(recipient, &encoded, rng)?)
}

/// Open a sealed initial message.
pub fn open(keys: &SealedBoxDecryptor, sealed: &[u8]) -> Result<InitialMessage, BootstrapError> {
    let encoded = decrypt_chunked(keys, sealed)?;
    ciborium::from_reader(encoded.as_slice()).map_err(|e| BootstrapError::Decode(e.to_string()))
}

/// Number of sealed chunks in `sealed`.
pub fn chunk_count(keys: &SealedBoxDecryptor, sealed: &[u8]) -> usize {
    debug_assert_eq!(keys.ciphertext_chunk_size(), SEALED_BOX_CIPHERTEXT_CHUNK);
    sealed.len() / keys.ciphertext_chunk_size()
}
