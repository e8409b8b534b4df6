//! X25519 key pairs for handshakes and DH ratchets.

use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// X25519 key pair. The secret half is zeroized on drop.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl DhKeyPair {
    /// Generate a fresh key pair from `rng`.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half as raw bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Copy of the secret half for snapshots.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 with a peer public key.
    ///
    /// Returns `None` when the result is non-contributory (the peer key is a
    /// small-order point), which must abort the caller's key agreement.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> Option<Zeroizing<[u8; 32]>> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return None;
        }
        Some(Zeroizing::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair").field("public", &self.public.as_bytes()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn both_sides_agree() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let alice = DhKeyPair::generate(&mut rng);
        let bob = DhKeyPair::generate(&mut rng);

        let ab = alice.diffie_hellman(&bob.public_bytes()).unwrap();
        let ba = bob.diffie_hellman(&alice.public_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn small_order_point_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let pair = DhKeyPair::generate(&mut rng);

        assert!(pair.diffie_hellman(&[0u8; 32]).is_none());
    }

    #[test]
    fn secret_bytes_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let pair = DhKeyPair::generate(&mut rng);
        let restored = DhKeyPair::from_secret_bytes(*pair.secret_bytes());

        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }
}
