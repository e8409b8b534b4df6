//! Chunked asymmetric encryption for pre-session bootstrap payloads.
//!
//! Asymmetric primitives cap the plaintext size of a single operation. The
//! codec splits a payload into fixed-size plaintext chunks, seals each one
//! independently and concatenates the results. Every sealed chunk has the same
//! length, so decryption splits on that size and fails fast on any remainder.
//!
//! ```text
//! plaintext:  [ chunk 0 (P) ][ chunk 1 (P) ][ chunk 2 (<= P) ]
//!                   │              │               │
//!                 seal           seal            seal
//!                   ▼              ▼               ▼
//! ciphertext: [  sealed (C)  ][  sealed (C)  ][  sealed (C)   ]
//! ```
//!
//! [`SealedBoxEncryptor`] / [`SealedBoxDecryptor`] implement the chunk cipher
//! with an ephemeral X25519 agreement, HKDF and XChaCha20-Poly1305. Each chunk
//! is length-prefixed and zero-padded to the full block before sealing.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    dh::DhKeyPair,
    error::{CodecError, SealError},
};

/// Plaintext ceiling per sealed-box chunk.
pub const SEALED_BOX_PLAINTEXT_CHUNK: usize = 190;

/// Length prefix inside the sealed block.
const LENGTH_PREFIX: usize = 2;

/// Padded block that is actually encrypted.
const BLOCK_LEN: usize = LENGTH_PREFIX + SEALED_BOX_PLAINTEXT_CHUNK;

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Sealed chunk length: ephemeral key, nonce, padded block and tag.
pub const SEALED_BOX_CIPHERTEXT_CHUNK: usize = EPHEMERAL_LEN + NONCE_LEN + BLOCK_LEN + TAG_LEN;

/// Label fed into HKDF's `info` field.
const SEALED_BOX_LABEL: &[u8] = b"keywardSealedBoxV1";

/// Encrypts one chunk at a time under a recipient's public key.
pub trait ChunkEncryptor {
    /// Error for a single chunk.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Largest plaintext accepted per chunk.
    fn plaintext_chunk_size(&self) -> usize;

    /// Encrypt a chunk of at most `plaintext_chunk_size()` bytes.
    fn encrypt_chunk<R: RngCore + CryptoRng>(
        &self,
        chunk: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, Self::Error>;
}

/// Decrypts chunks produced by the matching [`ChunkEncryptor`].
pub trait ChunkDecryptor {
    /// Error for a single chunk.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fixed length of every encrypted chunk.
    fn ciphertext_chunk_size(&self) -> usize;

    /// Decrypt one chunk of exactly `ciphertext_chunk_size()` bytes.
    fn decrypt_chunk(&self, chunk: &[u8]) -> Result<Vec<u8>, Self::Error>;
}

/// Encrypt `data` chunk by chunk and concatenate the results.
///
/// Empty input yields an empty blob.
///
/// # Errors
///
/// - `CodecError::EncryptionFailed` naming the first chunk that failed
pub fn encrypt_chunked<E: ChunkEncryptor, R: RngCore + CryptoRng>(
    cipher: &E,
    data: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for (chunk, plaintext) in data.chunks(cipher.plaintext_chunk_size()).enumerate() {
        let sealed = cipher
            .encrypt_chunk(plaintext, rng)
            .map_err(|err| CodecError::EncryptionFailed { chunk, source: Box::new(err) })?;
        out.extend_from_slice(&sealed);
    }
    Ok(out)
}

/// Split `blob` into fixed-size chunks, decrypt each, and concatenate.
///
/// # Errors
///
/// - `CodecError::MisalignedCiphertext` if `blob` is not a whole number of
///   chunks (checked before any decryption)
/// - `CodecError::DecryptionFailed` naming the first chunk that failed
pub fn decrypt_chunked<D: ChunkDecryptor>(cipher: &D, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
    let chunk_size = cipher.ciphertext_chunk_size();
    if blob.len() % chunk_size != 0 {
        return Err(CodecError::MisalignedCiphertext { length: blob.len(), chunk_size });
    }

    let mut out = Vec::new();
    for (chunk, sealed) in blob.chunks_exact(chunk_size).enumerate() {
        let plaintext = cipher
            .decrypt_chunk(sealed)
            .map_err(|err| CodecError::DecryptionFailed { chunk, source: Box::new(err) })?;
        out.extend_from_slice(&plaintext);
    }
    Ok(out)
}

/// Sealed-box encryptor bound to a recipient public key.
#[derive(Debug, Clone)]
pub struct SealedBoxEncryptor {
    recipient: [u8; 32],
}

impl SealedBoxEncryptor {
    /// Encrypt to `recipient`.
    pub fn new(recipient: [u8; 32]) -> Self {
        Self { recipient }
    }
}

impl ChunkEncryptor for SealedBoxEncryptor {
    type Error = SealError;

    fn plaintext_chunk_size(&self) -> usize {
        SEALED_BOX_PLAINTEXT_CHUNK
    }

    fn encrypt_chunk<R: RngCore + CryptoRng>(
        &self,
        chunk: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, SealError> {
        if chunk.len() > SEALED_BOX_PLAINTEXT_CHUNK {
            return Err(SealError::ChunkTooLarge {
                limit: SEALED_BOX_PLAINTEXT_CHUNK,
                actual: chunk.len(),
            });
        }

        let ephemeral = DhKeyPair::generate(rng);
        let ephemeral_public = ephemeral.public_bytes();
        let shared = ephemeral.diffie_hellman(&self.recipient).ok_or(SealError::NonContributory)?;
        let cipher = box_cipher(&shared, &ephemeral_public, &self.recipient);

        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);

        let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
        block[..LENGTH_PREFIX].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
        block[LENGTH_PREFIX..LENGTH_PREFIX + chunk.len()].copy_from_slice(chunk);

        let payload = Payload { msg: &block[..], aad: &ephemeral_public };
        let sealed = cipher.encrypt(XNonce::from_slice(&nonce), payload).map_err(|_| SealError::Aead)?;

        let mut out = Vec::with_capacity(SEALED_BOX_CIPHERTEXT_CHUNK);
        out.extend_from_slice(&ephemeral_public);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

/// Sealed-box decryptor holding the recipient key pair.
#[derive(Debug, Clone)]
pub struct SealedBoxDecryptor {
    keys: DhKeyPair,
}

impl SealedBoxDecryptor {
    /// Decrypt with `keys`.
    pub fn new(keys: DhKeyPair) -> Self {
        Self { keys }
    }

    /// Matching encryptor for this recipient.
    pub fn encryptor(&self) -> SealedBoxEncryptor {
        SealedBoxEncryptor::new(self.keys.public_bytes())
    }
}

impl ChunkDecryptor for SealedBoxDecryptor {
    type Error = SealError;

    fn ciphertext_chunk_size(&self) -> usize {
        SEALED_BOX_CIPHERTEXT_CHUNK
    }

    fn decrypt_chunk(&self, chunk: &[u8]) -> Result<Vec<u8>, SealError> {
        if chunk.len() != SEALED_BOX_CIPHERTEXT_CHUNK {
            return Err(SealError::InvalidLength {
                expected: SEALED_BOX_CIPHERTEXT_CHUNK,
                actual: chunk.len(),
            });
        }

        let (ephemeral_public, rest) = chunk.split_at(EPHEMERAL_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let mut ephemeral = [0u8; EPHEMERAL_LEN];
        ephemeral.copy_from_slice(ephemeral_public);

        let shared = self.keys.diffie_hellman(&ephemeral).ok_or(SealError::NonContributory)?;
        let cipher = box_cipher(&shared, &ephemeral, &self.keys.public_bytes());

        let payload = Payload { msg: sealed, aad: ephemeral_public };
        let block = Zeroizing::new(
            cipher.decrypt(XNonce::from_slice(nonce), payload).map_err(|_| SealError::Aead)?,
        );

        let len = u16::from_be_bytes([block[0], block[1]]) as usize;
        if len > SEALED_BOX_PLAINTEXT_CHUNK {
            return Err(SealError::Padding);
        }
        Ok(block[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec())
    }
}

fn box_cipher(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> XChaCha20Poly1305 {
    let mut info = Vec::with_capacity(SEALED_BOX_LABEL.len() + 64);
    info.extend_from_slice(SEALED_BOX_LABEL);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(recipient);

    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(&info, &mut key[..]) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    let Ok(cipher) = XChaCha20Poly1305::new_from_slice(&key[..]) else {
        unreachable!("XChaCha20-Poly1305 takes a 32-byte key");
    };
    cipher
}
