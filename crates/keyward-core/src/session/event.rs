//! Session milestones consumed by the persistence bridge.

/// Milestone emitted by a [`ProtocolSession`](super::ProtocolSession).
///
/// Events are buffered inside the session and handed out by
/// `drain_events`, so the session itself never performs I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Handshake completed and both chains are seeded
    SessionEstablished {
        /// Connection the session belongs to
        connect_id: u32,
    },

    /// A message was sealed with the sending chain
    MessageSent {
        /// Connection the session belongs to
        connect_id: u32,
        /// Epoch the message was sealed in
        epoch: u32,
        /// Sending index consumed
        index: u32,
    },

    /// A message was authenticated and opened
    MessageReceived {
        /// Connection the session belongs to
        connect_id: u32,
        /// Epoch the message was sealed in
        epoch: u32,
        /// Receiving index consumed
        index: u32,
    },

    /// Root key advanced and both chains were reseeded
    DhRatchetPerformed {
        /// Connection the session belongs to
        connect_id: u32,
        /// Epoch after the ratchet
        epoch: u32,
    },

    /// Peer acknowledged the latest rotation
    ChainSynchronized {
        /// Connection the session belongs to
        connect_id: u32,
        /// Acknowledged epoch
        epoch: u32,
    },

    /// Session was finalized by a fatal error
    CriticalError {
        /// Connection the session belongs to
        connect_id: u32,
        /// What failed
        reason: String,
    },
}

impl ProtocolEvent {
    /// Connection the event belongs to.
    pub fn connect_id(&self) -> u32 {
        match self {
            Self::SessionEstablished { connect_id }
            | Self::MessageSent { connect_id, .. }
            | Self::MessageReceived { connect_id, .. }
            | Self::DhRatchetPerformed { connect_id, .. }
            | Self::ChainSynchronized { connect_id, .. }
            | Self::CriticalError { connect_id, .. } => *connect_id,
        }
    }

    /// Whether this event is per-message traffic rather than a key milestone.
    pub fn is_message(&self) -> bool {
        matches!(self, Self::MessageSent { .. } | Self::MessageReceived { .. })
    }
}
