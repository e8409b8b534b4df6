//! Root and session key derivation using HKDF

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Label for expanding the handshake secret into session keys
const SESSION_LABEL: &[u8] = b"keywardSessionV1";

/// Label for the DH ratchet root KDF
const ROOT_LABEL: &[u8] = b"keywardRootV1";

/// Keys seeded from the handshake shared secret.
pub struct SessionKeys {
    /// Initial root key
    pub root_key: Zeroizing<[u8; 32]>,
    /// Chain key for messages from the initiator to the responder
    pub initiator_chain: Zeroizing<[u8; 32]>,
    /// Chain key for messages from the responder to the initiator
    pub responder_chain: Zeroizing<[u8; 32]>,
}

/// Keys produced by one DH ratchet.
pub struct RootKeys {
    /// Replacement root key
    pub root_key: Zeroizing<[u8; 32]>,
    /// Chain key for the side that performed the ratchet
    pub ratcheting_chain: Zeroizing<[u8; 32]>,
    /// Chain key for the side that observes the ratchet
    pub observing_chain: Zeroizing<[u8; 32]>,
}

/// Expand a handshake shared secret into a root key and one chain per
/// direction.
///
/// # Security
///
/// - Deterministic: both parties derive identical keys from the same secret
/// - The two chains never share a key, so the directions are independent
pub fn derive_session_keys(shared_secret: &[u8]) -> SessionKeys {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let [root_key, initiator_chain, responder_chain] = expand_three(&hkdf, SESSION_LABEL);
    SessionKeys { root_key, initiator_chain, responder_chain }
}

/// Mix a DH output into the root key.
///
/// The root key is the HKDF salt and the DH output the input key material,
/// so both must be known to reproduce the result.
pub fn derive_root_keys(root_key: &[u8; 32], dh_output: &[u8; 32]) -> RootKeys {
    let hkdf = Hkdf::<Sha256>::new(Some(&root_key[..]), dh_output);
    let [root_key, ratcheting_chain, observing_chain] = expand_three(&hkdf, ROOT_LABEL);
    RootKeys { root_key, ratcheting_chain, observing_chain }
}

fn expand_three(hkdf: &Hkdf<Sha256>, info: &[u8]) -> [Zeroizing<[u8; 32]>; 3] {
    let mut okm = Zeroizing::new([0u8; 96]);
    let Ok(()) = hkdf.expand(info, &mut okm[..]) else {
        unreachable!("96 bytes is a valid HKDF-SHA256 output length");
    };

    let split = |offset: usize| {
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&okm[offset..offset + 32]);
        key
    };
    [split(0), split(32), split(64)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_are_deterministic() {
        let a = derive_session_keys(b"shared secret material for tests");
        let b = derive_session_keys(b"shared secret material for tests");

        assert_eq!(*a.root_key, *b.root_key);
        assert_eq!(*a.initiator_chain, *b.initiator_chain);
        assert_eq!(*a.responder_chain, *b.responder_chain);
    }

    #[test]
    fn session_keys_are_distinct() {
        let keys = derive_session_keys(&[7u8; 32]);

        assert_ne!(*keys.root_key, *keys.initiator_chain);
        assert_ne!(*keys.initiator_chain, *keys.responder_chain);
        assert_ne!(*keys.root_key, *keys.responder_chain);
    }

    #[test]
    fn root_keys_depend_on_both_inputs() {
        let base = derive_root_keys(&[1u8; 32], &[2u8; 32]);
        let other_root = derive_root_keys(&[3u8; 32], &[2u8; 32]);
        let other_dh = derive_root_keys(&[1u8; 32], &[4u8; 32]);

        assert_ne!(*base.root_key, *other_root.root_key);
        assert_ne!(*base.root_key, *other_dh.root_key);
        assert_ne!(*base.ratcheting_chain, *other_dh.ratcheting_chain);
    }

    #[test]
    fn works_with_empty_secret() {
        let keys = derive_session_keys(&[]);
        assert_eq!(keys.root_key.len(), 32);
    }
}
