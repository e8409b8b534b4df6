//! Error types for Keyward cryptographic operations

use thiserror::Error;

/// Errors from hardened memory cells.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// The allocator could not provide a buffer of the requested size
    #[error("allocation of {requested} bytes failed")]
    AllocationFailed {
        /// Requested buffer length
        requested: usize,
    },

    /// Input is longer than the cell
    #[error("data too large: cell holds {capacity} bytes, got {actual}")]
    DataTooLarge {
        /// Fixed cell length
        capacity: usize,
        /// Length of the rejected input
        actual: usize,
    },

    /// Destination is shorter than the cell
    #[error("buffer too small: need {required} bytes, got {actual}")]
    BufferTooSmall {
        /// Fixed cell length
        required: usize,
        /// Length of the destination buffer
        actual: usize,
    },

    /// The cell was released and can no longer be used
    #[error("secure cell already disposed")]
    Disposed,
}

/// Errors from chain step key derivation and message sealing.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Requested index is behind the chain and not in the skipped-key cache
    #[error("key not found for index {index} (chain at {current})")]
    KeyNotFound {
        /// Requested index
        index: u32,
        /// Next index the chain would derive
        current: u32,
    },

    /// Requested index is further ahead than the look-ahead window allows
    #[error("message too far ahead: at index {current}, requested {requested}, window {window}")]
    MessageTooFarBehind {
        /// Next index the chain would derive
        current: u32,
        /// Requested index
        requested: u32,
        /// Configured look-ahead window
        window: u32,
    },

    /// The chain reached the index ceiling and must be rekeyed
    #[error("chain index overflow at {current}")]
    IndexOverflow {
        /// Index at which the overflow was detected
        current: u32,
    },

    /// Key derivation produced unusable output
    #[error("key derivation failed: {reason}")]
    KeyDerivation {
        /// What went wrong
        reason: String,
    },

    /// Authenticated decryption failed (tag mismatch or wrong key)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Snapshot contents violate chain invariants
    #[error("invalid chain snapshot: {reason}")]
    InvalidSnapshot {
        /// Which invariant failed
        reason: String,
    },

    /// Hardened memory failure while handling chain key material
    #[error("secure memory: {0}")]
    Memory(#[from] MemoryError),
}

impl ChainError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors mean the chain can no longer be trusted and the owning
    /// session must be finalized. Non-fatal errors reject a single message.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::IndexOverflow { .. }
            | Self::KeyDerivation { .. }
            | Self::InvalidSnapshot { .. }
            | Self::Memory(_) => true,

            Self::KeyNotFound { .. }
            | Self::MessageTooFarBehind { .. }
            | Self::DecryptionFailed { .. } => false,
        }
    }
}

/// Errors from the X3DH handshake.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Signed pre-key signature did not verify against the identity key
    #[error("signed pre-key signature verification failed")]
    InvalidSignature,

    /// A key agreement produced an all-zero (non-contributory) output
    #[error("non-contributory key agreement in {stage}")]
    NonContributory {
        /// Which DH computation was rejected
        stage: &'static str,
    },

    /// Key or signature material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Initiator has no pre-key bundle for the peer
    #[error("peer pre-key bundle missing")]
    PeerBundleMissing,

    /// Message references a signed pre-key we do not hold
    #[error("signed pre-key id mismatch: expected {expected}, got {actual}")]
    SignedPreKeyMismatch {
        /// Id of the signed pre-key supplied to the responder
        expected: u32,
        /// Id referenced by the initial message
        actual: u32,
    },

    /// Message references a one-time pre-key we do not hold
    #[error("one-time pre-key {id} missing")]
    OneTimePreKeyMissing {
        /// Referenced one-time pre-key id
        id: u32,
    },
}

/// Errors from the sealed-box chunk cipher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SealError {
    /// Chunk exceeds the plaintext ceiling
    #[error("chunk too large: limit {limit}, got {actual}")]
    ChunkTooLarge {
        /// Plaintext ceiling
        limit: usize,
        /// Length of the rejected chunk
        actual: usize,
    },

    /// Sealed chunk has the wrong length
    #[error("sealed chunk length {actual}, expected {expected}")]
    InvalidLength {
        /// Fixed sealed length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Key agreement with the ephemeral key was non-contributory
    #[error("non-contributory ephemeral key")]
    NonContributory,

    /// AEAD failure
    #[error("authentication failed")]
    Aead,

    /// Decrypted padding is inconsistent
    #[error("malformed padding")]
    Padding,
}

/// Errors from chunked asymmetric encoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encrypting a chunk failed
    #[error("encryption failed at chunk {chunk}")]
    EncryptionFailed {
        /// Zero-based chunk position
        chunk: usize,
        /// Underlying cipher error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Decrypting a chunk failed
    #[error("decryption failed at chunk {chunk}")]
    DecryptionFailed {
        /// Zero-based chunk position
        chunk: usize,
        /// Underlying cipher error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Ciphertext length is not a multiple of the sealed chunk size
    #[error("ciphertext length {length} is not a multiple of {chunk_size}")]
    MisalignedCiphertext {
        /// Blob length
        length: usize,
        /// Fixed ciphertext chunk size
        chunk_size: usize,
    },
}
