//! X3DH key agreement
//!
//! Establishes the shared secret that seeds a session. The responder
//! publishes a [`PreKeyBundle`] (identity keys, a signed pre-key and an
//! optional one-time pre-key). The initiator verifies the bundle, performs
//! three or four DH computations with a fresh ephemeral key, and sends an
//! [`InitialMessage`] so the responder can repeat them.
//!
//! ```text
//! Initiator                                   Responder
//! ─────────────────────────────────────────────────────────
//!                                  publish PreKeyBundle
//! fetch bundle  <────────────────────────────┘
//! verify SPK signature
//! DH1 = DH(IK_i, SPK_r)
//! DH2 = DH(EK_i, IK_r)
//! DH3 = DH(EK_i, SPK_r)
//! DH4 = DH(EK_i, OPK_r)   (if present)
//! InitialMessage ──────────────────────────────>  repeat DH1..DH4
//! ```
//!
//! An optional pre-shared key (for example an OPAQUE export key from the
//! authentication flow) is mixed in as the HKDF salt, binding the session to
//! that authentication.
//!
//! The ephemeral key becomes the initiator's first ratchet key and the signed
//! pre-key the responder's, so the first DH ratchet needs no extra round trip.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{dh::DhKeyPair, error::HandshakeError};

/// Label fed into HKDF's `info` field.
const X3DH_LABEL: &[u8] = b"keywardX3DHV1";

/// Ed25519 signature length.
const SIGNATURE_LEN: usize = 64;

/// Long-term identity: an Ed25519 signing key and an X25519 DH key.
pub struct IdentityKeys {
    signing: SigningKey,
    dh: DhKeyPair,
}

impl IdentityKeys {
    /// Generate a fresh identity.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing = SigningKey::generate(rng);
        let dh = DhKeyPair::generate(rng);
        Self { signing, dh }
    }

    /// Public half of the identity.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            signing_key: self.signing.verifying_key().to_bytes(),
            dh_key: self.dh.public_bytes(),
        }
    }
}

/// Public identity keys as exchanged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Ed25519 verifying key
    pub signing_key: [u8; 32],
    /// X25519 public key
    pub dh_key: [u8; 32],
}

impl PublicIdentity {
    /// Build from untrusted byte slices.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::InvalidKeyLength` if either slice is not 32 bytes
    pub fn from_slices(signing_key: &[u8], dh_key: &[u8]) -> Result<Self, HandshakeError> {
        Ok(Self { signing_key: to_key(signing_key)?, dh_key: to_key(dh_key)? })
    }

    fn encode(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.signing_key);
        out[32..].copy_from_slice(&self.dh_key);
        out
    }
}

/// Medium-term pre-key signed by the identity key.
pub struct SignedPreKey {
    id: u32,
    keys: DhKeyPair,
    signature: [u8; SIGNATURE_LEN],
}

impl SignedPreKey {
    /// Generate a pre-key and sign its public half with `identity`.
    pub fn generate<R: RngCore + CryptoRng>(identity: &IdentityKeys, id: u32, rng: &mut R) -> Self {
        let keys = DhKeyPair::generate(rng);
        let signature = identity.signing.sign(&keys.public_bytes()).to_bytes();
        Self { id, keys, signature }
    }

    /// Pre-key identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Public pre-key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.keys.public_bytes()
    }
}

/// Single-use pre-key.
pub struct OneTimePreKey {
    id: u32,
    keys: DhKeyPair,
}

impl OneTimePreKey {
    /// Generate a one-time pre-key.
    pub fn generate<R: RngCore + CryptoRng>(id: u32, rng: &mut R) -> Self {
        Self { id, keys: DhKeyPair::generate(rng) }
    }

    /// Pre-key identifier.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Published responder material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Responder identity
    pub identity: PublicIdentity,
    /// Signed pre-key identifier
    pub signed_pre_key_id: u32,
    /// Signed pre-key public bytes
    pub signed_pre_key: [u8; 32],
    /// Ed25519 signature over `signed_pre_key`
    pub signed_pre_key_signature: Vec<u8>,
    /// Optional one-time pre-key (id, public bytes)
    pub one_time_pre_key: Option<(u32, [u8; 32])>,
}

impl PreKeyBundle {
    /// Assemble a bundle from the responder's private material.
    pub fn new(
        identity: &IdentityKeys,
        signed_pre_key: &SignedPreKey,
        one_time_pre_key: Option<&OneTimePreKey>,
    ) -> Self {
        Self {
            identity: identity.public(),
            signed_pre_key_id: signed_pre_key.id,
            signed_pre_key: signed_pre_key.public_bytes(),
            signed_pre_key_signature: signed_pre_key.signature.to_vec(),
            one_time_pre_key: one_time_pre_key.map(|key| (key.id, key.keys.public_bytes())),
        }
    }

    /// Verify the signed pre-key against the bundle's identity.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::InvalidKeyLength` if the signature is not 64 bytes
    /// - `HandshakeError::InvalidSignature` if verification fails
    pub fn verify(&self) -> Result<(), HandshakeError> {
        let signature = Signature::from_slice(&self.signed_pre_key_signature).map_err(|_| {
            HandshakeError::InvalidKeyLength {
                expected: SIGNATURE_LEN,
                actual: self.signed_pre_key_signature.len(),
            }
        })?;
        let verifying_key = VerifyingKey::from_bytes(&self.identity.signing_key)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        verifying_key
            .verify_strict(&self.signed_pre_key, &signature)
            .map_err(|_| HandshakeError::InvalidSignature)
    }
}

/// First message from initiator to responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMessage {
    /// Initiator identity
    pub identity: PublicIdentity,
    /// Initiator ephemeral public key
    pub ephemeral_key: [u8; 32],
    /// Which signed pre-key was used
    pub signed_pre_key_id: u32,
    /// Which one-time pre-key was used, if any
    pub one_time_pre_key_id: Option<u32>,
}

/// Result of a completed handshake on either side.
pub struct HandshakeSecret {
    /// 32-byte shared secret
    pub shared_secret: Zeroizing<[u8; 32]>,
    /// Initiator identity || responder identity, bound into the session
    pub associated_data: Vec<u8>,
    /// Local key pair that starts the DH ratchet
    pub local_ratchet: DhKeyPair,
    /// Peer public key that starts the DH ratchet
    pub peer_ratchet: [u8; 32],
    /// Peer identity
    pub peer_identity: PublicIdentity,
}

/// Run the initiator side against a peer bundle.
///
/// # Errors
///
/// - `HandshakeError::PeerBundleMissing` if `bundle` is `None`
/// - `HandshakeError::InvalidSignature` / `InvalidKeyLength` if the bundle
///   does not verify
/// - `HandshakeError::NonContributory` if any DH output is all zeros
pub fn initiate<R: RngCore + CryptoRng>(
    identity: &IdentityKeys,
    bundle: Option<&PreKeyBundle>,
    pre_shared_key: Option<&[u8]>,
    rng: &mut R,
) -> Result<(InitialMessage, HandshakeSecret), HandshakeError> {
    let bundle = bundle.ok_or(HandshakeError::PeerBundleMissing)?;
    bundle.verify()?;

    let ephemeral = DhKeyPair::generate(rng);
    let dh1 = agree(&identity.dh, &bundle.signed_pre_key, "DH1")?;
    let dh2 = agree(&ephemeral, &bundle.identity.dh_key, "DH2")?;
    let dh3 = agree(&ephemeral, &bundle.signed_pre_key, "DH3")?;
    let dh4 = bundle
        .one_time_pre_key
        .map(|(_, key)| agree(&ephemeral, &key, "DH4"))
        .transpose()?;

    let shared_secret = kdf(&dh1, &dh2, &dh3, dh4.as_ref(), pre_shared_key);

    let mut associated_data = Vec::with_capacity(128);
    associated_data.extend_from_slice(&identity.public().encode());
    associated_data.extend_from_slice(&bundle.identity.encode());

    let message = InitialMessage {
        identity: identity.public(),
        ephemeral_key: ephemeral.public_bytes(),
        signed_pre_key_id: bundle.signed_pre_key_id,
        one_time_pre_key_id: bundle.one_time_pre_key.map(|(id, _)| id),
    };

    Ok((
        message,
        HandshakeSecret {
            shared_secret,
            associated_data,
            local_ratchet: ephemeral,
            peer_ratchet: bundle.signed_pre_key,
            peer_identity: bundle.identity,
        },
    ))
}

/// Run the responder side for a received [`InitialMessage`].
///
/// # Errors
///
/// - `HandshakeError::SignedPreKeyMismatch` if the message names another
///   signed pre-key
/// - `HandshakeError::OneTimePreKeyMissing` if the message names a one-time
///   pre-key that was not supplied
/// - `HandshakeError::NonContributory` if any DH output is all zeros
pub fn respond(
    identity: &IdentityKeys,
    signed_pre_key: &SignedPreKey,
    one_time_pre_key: Option<&OneTimePreKey>,
    message: &InitialMessage,
    pre_shared_key: Option<&[u8]>,
) -> Result<HandshakeSecret, HandshakeError> {
    if message.signed_pre_key_id != signed_pre_key.id {
        return Err(HandshakeError::SignedPreKeyMismatch {
            expected: signed_pre_key.id,
            actual: message.signed_pre_key_id,
        });
    }

    let one_time = match message.one_time_pre_key_id {
        Some(id) => match one_time_pre_key {
            Some(key) if key.id == id => Some(key),
            _ => return Err(HandshakeError::OneTimePreKeyMissing { id }),
        },
        None => None,
    };

    let dh1 = agree(&signed_pre_key.keys, &message.identity.dh_key, "DH1")?;
    let dh2 = agree(&identity.dh, &message.ephemeral_key, "DH2")?;
    let dh3 = agree(&signed_pre_key.keys, &message.ephemeral_key, "DH3")?;
    let dh4 = one_time.map(|key| agree(&key.keys, &message.ephemeral_key, "DH4")).transpose()?;

    let shared_secret = kdf(&dh1, &dh2, &dh3, dh4.as_ref(), pre_shared_key);

    let mut associated_data = Vec::with_capacity(128);
    associated_data.extend_from_slice(&message.identity.encode());
    associated_data.extend_from_slice(&identity.public().encode());

    Ok(HandshakeSecret {
        shared_secret,
        associated_data,
        local_ratchet: signed_pre_key.keys.clone(),
        peer_ratchet: message.ephemeral_key,
        peer_identity: message.identity,
    })
}

fn agree(
    local: &DhKeyPair,
    peer: &[u8; 32],
    stage: &'static str,
) -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
    local.diffie_hellman(peer).ok_or(HandshakeError::NonContributory { stage })
}

fn kdf(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&Zeroizing<[u8; 32]>>,
    pre_shared_key: Option<&[u8]>,
) -> Zeroizing<[u8; 32]> {
    // 0xFF prefix separates X3DH input from other uses of the curve keys
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&[0xFF; 32]);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4[..]);
    }

    let salt = pre_shared_key.unwrap_or(&[0u8; 32]);
    let hkdf = Hkdf::<Sha256>::new(Some(salt), &ikm);

    let mut okm = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(X3DH_LABEL, &mut okm[..]) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    okm
}

fn to_key(bytes: &[u8]) -> Result<[u8; 32], HandshakeError> {
    bytes
        .try_into()
        .map_err(|_| HandshakeError::InvalidKeyLength { expected: 32, actual: bytes.len() })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    struct Responder {
        identity: IdentityKeys,
        signed: SignedPreKey,
        one_time: OneTimePreKey,
    }

    fn responder(rng: &mut ChaCha20Rng) -> Responder {
        let identity = IdentityKeys::generate(rng);
        let signed = SignedPreKey::generate(&identity, 1, rng);
        let one_time = OneTimePreKey::generate(7, rng);
        Responder { identity, signed, one_time }
    }

    #[test]
    fn both_sides_derive_same_secret() {
        let mut rng = ChaCha20Rng::seed_from_u64(10);
        let alice = IdentityKeys::generate(&mut rng);
        let bob = responder(&mut rng);
        let bundle = PreKeyBundle::new(&bob.identity, &bob.signed, Some(&bob.one_time));

        let (message, initiator) = initiate(&alice, Some(&bundle), None, &mut rng).unwrap();
        let responder =
            respond(&bob.identity, &bob.signed, Some(&bob.one_time), &message, None).unwrap();

        assert_eq!(*initiator.shared_secret, *responder.shared_secret);
        assert_eq!(initiator.associated_data, responder.associated_data);
        assert_eq!(initiator.peer_ratchet, responder.local_ratchet.public_bytes());
        assert_eq!(responder.peer_ratchet, initiator.local_ratchet.public_bytes());
        assert_eq!(initiator.peer_identity, bob.identity.public());
        assert_eq!(responder.peer_identity, alice.public());
    }

    #[test]
    fn works_without_one_time_pre_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let alice = IdentityKeys::generate(&mut rng);
        let bob = responder(&mut rng);
        let bundle = PreKeyBundle::new(&bob.identity, &bob.signed, None);

        let (message, initiator) = initiate(&alice, Some(&bundle), None, &mut rng).unwrap();
        assert_eq!(message.one_time_pre_key_id, None);

        let responder = respond(&bob.identity, &bob.signed, None, &message, None).unwrap();
        assert_eq!(*initiator.shared_secret, *responder.shared_secret);
    }

    #[test]
    fn pre_shared_key_is_mixed_in() {
        let mut rng = ChaCha20Rng::seed_from_u64(12);
        let alice = IdentityKeys::generate(&mut rng);
        let bob = responder(&mut rng);
        let bundle = PreKeyBundle::new(&bob.identity, &bob.signed, None);

        let (message, initiator) =
            initiate(&alice, Some(&bundle), Some(b"opaque export key"), &mut rng).unwrap();
        let matching =
            respond(&bob.identity, &bob.signed, None, &message, Some(b"opaque export key"))
                .unwrap();
        let mismatched = respond(&bob.identity, &bob.signed, None, &message, None).unwrap();

        assert_eq!(*initiator.shared_secret, *matching.shared_secret);
        assert_ne!(*initiator.shared_secret, *mismatched.shared_secret);
    }

    #[test]
    fn missing_bundle_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(13);
        let alice = IdentityKeys::generate(&mut rng);

        let result = initiate(&alice, None, None, &mut rng);
        assert!(matches!(result, Err(HandshakeError::PeerBundleMissing)));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(14);
        let alice = IdentityKeys::generate(&mut rng);
        let bob = responder(&mut rng);
        let mut bundle = PreKeyBundle::new(&bob.identity, &bob.signed, None);
        bundle.signed_pre_key_signature[0] ^= 0x01;

        let result = initiate(&alice, Some(&bundle), None, &mut rng);
        assert!(matches!(result, Err(HandshakeError::InvalidSignature)));
    }

    #[test]
    fn swapped_pre_key_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(15);
        let alice = IdentityKeys::generate(&mut rng);
        let bob = responder(&mut rng);
        let mut bundle = PreKeyBundle::new(&bob.identity, &bob.signed, None);
        bundle.signed_pre_key = DhKeyPair::generate(&mut rng).public_bytes();

        let result = initiate(&alice, Some(&bundle), None, &mut rng);
        assert!(matches!(result, Err(HandshakeError::InvalidSignature)));
    }

    #[test]
    fn short_signature_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(16);
        let bob = responder(&mut rng);
        let mut bundle = PreKeyBundle::new(&bob.identity, &bob.signed, None);
        bundle.signed_pre_key_signature.truncate(63);

        assert_eq!(
            bundle.verify(),
            Err(HandshakeError::InvalidKeyLength { expected: 64, actual: 63 })
        );
    }

    #[test]
    fn small_order_ephemeral_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(17);
        let alice = IdentityKeys::generate(&mut rng);
        let bob = responder(&mut rng);
        let bundle = PreKeyBundle::new(&bob.identity, &bob.signed, None);

        let (mut message, _) = initiate(&alice, Some(&bundle), None, &mut rng).unwrap();
        message.ephemeral_key = [0u8; 32];

        let result = respond(&bob.identity, &bob.signed, None, &message, None);
        assert!(matches!(result, Err(HandshakeError::NonContributory { stage: "DH2" })));
    }

    #[test]
    fn unknown_pre_keys_are_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(18);
        let alice = IdentityKeys::generate(&mut rng);
        let bob = responder(&mut rng);
        let bundle = PreKeyBundle::new(&bob.identity, &bob.signed, Some(&bob.one_time));
        let (message, _) = initiate(&alice, Some(&bundle), None, &mut rng).unwrap();

        let result = respond(&bob.identity, &bob.signed, None, &message, None);
        assert_eq!(result.err(), Some(HandshakeError::OneTimePreKeyMissing { id: 7 }));

        let other = SignedPreKey::generate(&bob.identity, 2, &mut rng);
        let result = respond(&bob.identity, &other, Some(&bob.one_time), &message, None);
        assert_eq!(
            result.err(),
            Some(HandshakeError::SignedPreKeyMismatch { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn public_identity_rejects_wrong_length() {
        assert_eq!(
            PublicIdentity::from_slices(&[0u8; 31], &[0u8; 32]),
            Err(HandshakeError::InvalidKeyLength { expected: 32, actual: 31 })
        );
        assert!(PublicIdentity::from_slices(&[1u8; 32], &[2u8; 32]).is_ok());
    }
}
