//! Sealed message envelope and its CBOR wire form.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Cleartext header bound into every ciphertext as associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Connection the message belongs to
    pub connect_id: u32,
    /// Ratchet epoch the message was sealed in
    pub epoch: u32,
    /// Sending chain index
    pub index: u32,
    /// Sender's current ratchet public key while a rotation is unacknowledged
    pub ratchet_key: Option<[u8; 32]>,
}

impl MessageHeader {
    /// Associated data for this header: fixed header layout followed by the
    /// session's identity binding.
    ///
    /// ```text
    /// connect_id (4) | epoch (4) | index (4) | flag (1) | ratchet_key (0 or 32) | session_ad
    /// ```
    pub fn associated_data(&self, session_ad: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(45 + session_ad.len());
        aad.extend_from_slice(&self.connect_id.to_be_bytes());
        aad.extend_from_slice(&self.epoch.to_be_bytes());
        aad.extend_from_slice(&self.index.to_be_bytes());
        match &self.ratchet_key {
            Some(key) => {
                aad.push(1);
                aad.extend_from_slice(key);
            },
            None => aad.push(0),
        }
        aad.extend_from_slice(session_ad);
        aad
    }
}

/// Header, nonce and ciphertext of one sealed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Authenticated cleartext header
    pub header: MessageHeader,
    /// 24-byte `XChaCha20` nonce
    pub nonce: [u8; 24],
    /// Ciphertext with appended Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Encode as CBOR for the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| SessionError::MalformedEnvelope {
            reason: format!("CBOR encode failed: {e}"),
        })?;
        Ok(bytes)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        ciborium::from_reader(bytes).map_err(|e| SessionError::MalformedEnvelope {
            reason: format!("CBOR decode failed: {e}"),
        })
    }
}
