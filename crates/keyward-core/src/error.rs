//! Error types for the Keyward session core.
//!
//! Session errors separate three families: caller mistakes (wrong state,
//! wrong connection), per-message rejections that leave the session usable
//! (replay, missing key, failed authentication) and critical failures that
//! finalize the session.

use keyward_crypto::{ChainError, HandshakeError, MemoryError};
use thiserror::Error;

use crate::session::SessionState;

/// Errors from protocol session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not allowed in the current state
    #[error("invalid state: cannot {operation} in {state:?}")]
    InvalidState {
        /// Current state when the error occurred
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Session is finalized and can no longer be used
    #[error("session finalized")]
    SessionFinalized,

    /// Handshake key material failed validation
    #[error("handshake failed: {0}")]
    HandshakeFailed(HandshakeError),

    /// Initiator has no bundle for the remote party
    #[error("peer pre-key bundle missing")]
    PeerBundleMissing,

    /// Message index was already consumed in this receiving epoch
    #[error("replay detected: epoch {epoch}, index {index}")]
    ReplayDetected {
        /// Receiving epoch
        epoch: u32,
        /// Replayed message index
        index: u32,
    },

    /// Key for this message is no longer (or not yet) derivable
    #[error("message key not available: epoch {epoch}, index {index}")]
    KeyNotFound {
        /// Epoch named by the message header
        epoch: u32,
        /// Index named by the message header
        index: u32,
    },

    /// Message index is beyond the look-ahead window
    #[error("message too far ahead: chain at {current}, requested {requested}, window {window}")]
    MessageTooFarBehind {
        /// Next index the receiving chain would derive
        current: u32,
        /// Requested index
        requested: u32,
        /// Configured window
        window: u32,
    },

    /// Authentication of the ciphertext failed; session state is unchanged
    #[error("decryption failed")]
    DecryptionFailed,

    /// Envelope belongs to another connection
    #[error("connection mismatch: session {expected}, envelope {actual}")]
    ConnectionMismatch {
        /// Connection id of this session
        expected: u32,
        /// Connection id carried by the envelope
        actual: u32,
    },

    /// Envelope bytes could not be decoded
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Decoder message
        reason: String,
    },

    /// A previous rotation has not been acknowledged by the peer yet
    #[error("ratchet rotation pending acknowledgement (epoch {epoch})")]
    RotationPending {
        /// Epoch of the unacknowledged rotation
        epoch: u32,
    },

    /// Only the initiator rotates ratchet keys
    #[error("ratchet rotation not permitted for responder")]
    RotationNotPermitted,

    /// Memory, key derivation or overflow failure; the session is finalized
    #[error("critical session error: {reason}")]
    CriticalError {
        /// What failed
        reason: String,
    },

    /// Snapshot could not be produced or restored
    #[error("snapshot error: {reason}")]
    Snapshot {
        /// What was wrong with the snapshot
        reason: String,
    },
}

impl SessionError {
    /// Returns true if the session was finalized by this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CriticalError { .. } | Self::SessionFinalized)
    }

    /// Returns true if the error rejects a single message and the session
    /// remains usable.
    pub fn is_message_rejection(&self) -> bool {
        matches!(
            self,
            Self::ReplayDetected { .. }
                | Self::KeyNotFound { .. }
                | Self::MessageTooFarBehind { .. }
                | Self::DecryptionFailed
                | Self::MalformedEnvelope { .. }
        )
    }
}

impl From<HandshakeError> for SessionError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::PeerBundleMissing => Self::PeerBundleMissing,
            other => Self::HandshakeFailed(other),
        }
    }
}

impl From<MemoryError> for SessionError {
    fn from(err: MemoryError) -> Self {
        Self::CriticalError { reason: err.to_string() }
    }
}

impl SessionError {
    /// Map a chain error observed while receiving at `epoch`.
    pub(crate) fn from_chain(err: ChainError, epoch: u32) -> Self {
        match err {
            ChainError::KeyNotFound { index, .. } => Self::KeyNotFound { epoch, index },
            ChainError::MessageTooFarBehind { current, requested, window } => {
                Self::MessageTooFarBehind { current, requested, window }
            },
            ChainError::DecryptionFailed { .. } => Self::DecryptionFailed,
            other => Self::CriticalError { reason: other.to_string() },
        }
    }
}
