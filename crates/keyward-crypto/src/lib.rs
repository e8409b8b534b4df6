//! Keyward Cryptographic Primitives
//!
//! Cryptographic building blocks for Keyward sessions. Pure functions and
//! self-contained state with deterministic outputs. Callers provide random
//! bytes (or an RNG) so every path can be replayed in tests.
//!
//! # Key Lifecycle
//!
//! A session starts from an X3DH handshake. The shared secret seeds a root
//! key and one chain per direction. Each chain step produces one-time message
//! keys. A DH ratchet mixes a fresh key agreement into the root key and
//! reseeds both chains.
//!
//! ```text
//! X3DH Shared Secret
//!        │
//!        ▼
//! HKDF → Root Key + Chain Keys (initiator→responder, responder→initiator)
//!        │
//!        ├── DH ratchet: HKDF(root key, DH output) → new root + chain keys
//!        ▼
//! Chain Step (HMAC) → Message Keys
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys live in a [`SecureCell`] and are overwritten on every step
//! - Message keys are zeroized on drop
//! - Skipped keys are kept only inside a bounded window
//!
//! Post-Compromise Security:
//! - DH ratchet replaces the local key pair and reseeds both chains
//! - Old chain keys are unrecoverable once reseeded
//!
//! Authenticity:
//! - XChaCha20-Poly1305 binds the message header as associated data
//! - Signed pre-keys are verified with Ed25519 before key agreement
//! - Non-contributory (small-order) DH results are rejected

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod chain;
pub mod chunked;
pub mod dh;
pub mod error;
pub mod handshake;
pub mod secure_memory;

pub use chain::{
    ChainStep, ChainStepSnapshot, DEFAULT_WINDOW, MessageKey, NONCE_RANDOM_SIZE, RootKeys,
    SessionKeys, build_nonce, decrypt_with_key, derive_root_keys, derive_session_keys,
    encrypt_with_key,
};
pub use chunked::{
    ChunkDecryptor, ChunkEncryptor, SEALED_BOX_CIPHERTEXT_CHUNK, SEALED_BOX_PLAINTEXT_CHUNK,
    SealedBoxDecryptor, SealedBoxEncryptor, decrypt_chunked, encrypt_chunked,
};
pub use dh::DhKeyPair;
pub use error::{ChainError, CodecError, HandshakeError, MemoryError, SealError};
pub use handshake::{
    HandshakeSecret, IdentityKeys, InitialMessage, OneTimePreKey, PreKeyBundle, PublicIdentity,
    SignedPreKey, initiate, respond,
};
pub use secure_memory::SecureCell;
