//! Serializable session state for persistence and restore.

use keyward_crypto::{ChainStepSnapshot, PublicIdentity};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use super::{Role, replay::ReplayGuard};
use crate::error::SessionError;

/// Everything needed to resume a session after a restart.
///
/// A finalized session snapshots to a marker without key material; restoring
/// it fails with [`SessionError::SessionFinalized`], so a crash right after a
/// critical error cannot resurrect compromised state.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Connection the session belongs to
    pub connect_id: u32,
    /// Session was finalized when saved
    pub finalized: bool,
    /// Whether the session was still recovering when saved
    pub recovering: bool,
    /// Unix seconds at which the snapshot was taken
    pub saved_at_secs: u64,
    pub(crate) keys: Option<EstablishedSnapshot>,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct EstablishedSnapshot {
    pub(crate) role: Role,
    pub(crate) epoch: u32,
    pub(crate) root_key: [u8; 32],
    pub(crate) sending: ChainStepSnapshot,
    pub(crate) receiving: ChainStepSnapshot,
    pub(crate) peer_ratchet: [u8; 32],
    pub(crate) peer_identity: PublicIdentity,
    pub(crate) associated_data: Vec<u8>,
    pub(crate) awaiting_ack: bool,
    pub(crate) sent_since_rotation: u32,
    pub(crate) replay: ReplayGuard,
}

impl Drop for EstablishedSnapshot {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl SessionSnapshot {
    /// Ratchet epoch, if the snapshot carries key material.
    pub fn epoch(&self) -> Option<u32> {
        self.keys.as_ref().map(|keys| keys.epoch)
    }

    /// Session role, if the snapshot carries key material.
    pub fn role(&self) -> Option<Role> {
        self.keys.as_ref().map(|keys| keys.role)
    }

    /// Next sending index, if the snapshot carries key material.
    pub fn sending_index(&self) -> Option<u32> {
        self.keys.as_ref().map(|keys| keys.sending.index())
    }

    /// Encode as CBOR. The buffer holds key material and is wiped on drop.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, SessionError> {
        let mut bytes = Zeroizing::new(Vec::new());
        ciborium::into_writer(self, &mut *bytes)
            .map_err(|e| SessionError::Snapshot { reason: format!("CBOR encode failed: {e}") })?;
        Ok(bytes)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        ciborium::from_reader(bytes)
            .map_err(|e| SessionError::Snapshot { reason: format!("CBOR decode failed: {e}") })
    }
}

impl std::fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("connect_id", &self.connect_id)
            .field("finalized", &self.finalized)
            .field("epoch", &self.epoch())
            .field("saved_at_secs", &self.saved_at_secs)
            .finish_non_exhaustive()
    }
}
