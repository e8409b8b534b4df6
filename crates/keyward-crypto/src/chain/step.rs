//! Chain step for forward-secure per-direction key derivation
//!
//! # Security Properties
//!
//! - Forward Secrecy: the chain key is overwritten in its [`SecureCell`] on
//!   every step, so earlier message keys cannot be rederived
//! - Key Uniqueness: each index produces a unique message key
//! - Bounded Reordering: skipped keys are cached only inside a fixed window;
//!   anything older is lost for good
//! - Determinism: same seed always produces same key sequence

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{dh::DhKeyPair, error::ChainError, secure_memory::SecureCell};

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = &[0x01];

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = &[0x02];

/// Chain keys are always 32 bytes.
const CHAIN_KEY_LEN: usize = 32;

/// Default look-ahead window: the largest forward gap accepted in one step,
/// and the number of skipped keys retained.
pub const DEFAULT_WINDOW: u32 = 1000;

/// A message key derived from a chain step.
///
/// Used for a single message encryption/decryption, then discarded.
#[derive(Clone)]
pub struct MessageKey {
    /// The 32-byte symmetric key for XChaCha20-Poly1305
    key: [u8; 32],
    /// The chain index this key was derived at
    index: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Chain index this key was derived at.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// One direction of a session's symmetric ratchet.
///
/// `index()` is the next index the chain will derive. Requests at or ahead
/// of it walk the chain forward, caching every key they skip. Requests behind
/// it are served from the cache only, and each cached key is handed out once.
///
/// ```text
///            window (cached skipped keys)
///        ┌──────────────────────────────┐
///  ... ──┤ k[i-w] ... k[i-2]  k[i-1]    ├── CK[i] ──> CK[i+1] ──> ...
///        └──────────────────────────────┘     │
///                                             └─ next index to derive
/// ```
///
/// A ratchet-capable step also carries the local DH key pair for the session
/// it belongs to.
pub struct ChainStep {
    /// Current chain key (32 bytes, hardened)
    chain_key: SecureCell,
    /// Next index to derive
    index: u32,
    /// Look-ahead window and cache bound
    window: u32,
    /// Keys skipped over by forward jumps, by index
    skipped: BTreeMap<u32, MessageKey>,
    /// Local DH key pair when this step can drive a DH ratchet
    dh_keys: Option<DhKeyPair>,
}

impl ChainStep {
    /// Create a step at index 0 from a 32-byte chain key cell.
    ///
    /// # Errors
    ///
    /// - `ChainError::KeyDerivation` if the cell is not 32 bytes
    pub fn new(chain_key: SecureCell, window: u32) -> Result<Self, ChainError> {
        if chain_key.len() != CHAIN_KEY_LEN {
            return Err(ChainError::KeyDerivation {
                reason: format!("chain key must be {CHAIN_KEY_LEN} bytes, got {}", chain_key.len()),
            });
        }

        Ok(Self { chain_key, index: 0, window, skipped: BTreeMap::new(), dh_keys: None })
    }

    /// Create a step at index 0, copying `chain_key` into a fresh cell.
    pub fn from_key(chain_key: &[u8; 32], window: u32) -> Result<Self, ChainError> {
        Self::new(SecureCell::from_slice(chain_key)?, window)
    }

    /// Attach the local DH key pair.
    #[must_use]
    pub fn with_dh_keys(mut self, keys: DhKeyPair) -> Self {
        self.dh_keys = Some(keys);
        self
    }

    /// Next index this chain will derive.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Look-ahead window.
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Number of cached skipped keys.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Local DH key pair, if this step is ratchet-capable.
    pub fn dh_keys(&self) -> Option<&DhKeyPair> {
        self.dh_keys.as_ref()
    }

    /// Replace the local DH key pair.
    pub fn replace_dh_keys(&mut self, keys: DhKeyPair) {
        self.dh_keys = Some(keys);
    }

    /// Derive the key at the current index and advance by one.
    pub fn next_sending_key(&mut self) -> Result<MessageKey, ChainError> {
        self.derive_key(self.index)
    }

    /// Derive the message key for `target`.
    ///
    /// - `target >= index()`: walks forward, caching skipped keys, and moves
    ///   the index to `target + 1`
    /// - `target < index()`: removes and returns the cached key
    ///
    /// # Errors
    ///
    /// - `ChainError::KeyNotFound` if `target` is behind and not cached
    /// - `ChainError::MessageTooFarBehind` if the forward gap exceeds the
    ///   window
    /// - `ChainError::IndexOverflow` if `target` is the index ceiling and
    ///   within the window
    /// - `ChainError::Memory` if the chain key cell is unusable
    ///
    /// On error the step is unchanged.
    pub fn derive_key(&mut self, target: u32) -> Result<MessageKey, ChainError> {
        if target < self.index {
            return self
                .skipped
                .remove(&target)
                .ok_or(ChainError::KeyNotFound { index: target, current: self.index });
        }

        // Window before ceiling, so a forged far index stays recoverable
        if target - self.index > self.window {
            return Err(ChainError::MessageTooFarBehind {
                current: self.index,
                requested: target,
                window: self.window,
            });
        }

        if target == u32::MAX {
            return Err(ChainError::IndexOverflow { current: self.index });
        }

        let mut chain_key = self.load_chain_key()?;
        let mut newly_skipped = Vec::with_capacity((target - self.index) as usize);
        for index in self.index..target {
            let (message_key, next_chain_key) = kdf_step(&chain_key);
            newly_skipped.push(MessageKey { key: *message_key, index });
            *chain_key = *next_chain_key;
        }

        let (message_key, next_chain_key) = kdf_step(&chain_key);
        self.chain_key.write(&next_chain_key[..])?;

        self.index = target + 1;
        for key in newly_skipped {
            self.skipped.insert(key.index, key);
        }
        let floor = target.saturating_sub(self.window);
        self.skipped = self.skipped.split_off(&floor);

        Ok(MessageKey { key: *message_key, index: target })
    }

    /// Replace the chain key, drop every cached key and restart at index 0.
    pub fn reseed(&mut self, chain_key: &[u8; 32]) -> Result<(), ChainError> {
        self.chain_key.write(chain_key)?;
        self.index = 0;
        self.skipped.clear();
        Ok(())
    }

    /// Independent copy for staged derivation.
    ///
    /// Work on the copy and swap it in only once the result is known good.
    pub fn fork(&self) -> Result<Self, ChainError> {
        Ok(Self {
            chain_key: self.chain_key.try_clone()?,
            index: self.index,
            window: self.window,
            skipped: self.skipped.clone(),
            dh_keys: self.dh_keys.clone(),
        })
    }

    /// Wipe the chain key and drop all cached keys and the DH key pair.
    pub fn release(&mut self) {
        self.chain_key.release();
        self.skipped.clear();
        self.dh_keys = None;
    }

    /// Capture the full step state.
    pub fn snapshot(&self) -> Result<ChainStepSnapshot, ChainError> {
        let chain_key = self.load_chain_key()?;
        Ok(ChainStepSnapshot {
            chain_key: *chain_key,
            index: self.index,
            window: self.window,
            skipped: self
                .skipped
                .values()
                .map(|key| SkippedKey { index: key.index, key: key.key })
                .collect(),
            dh_secret: self.dh_keys.as_ref().map(|keys| *keys.secret_bytes()),
        })
    }

    /// Rebuild a step from a snapshot.
    ///
    /// # Errors
    ///
    /// - `ChainError::InvalidSnapshot` if a cached key is not behind the
    ///   chain index or the cache exceeds the window
    pub fn restore(snapshot: &ChainStepSnapshot) -> Result<Self, ChainError> {
        if snapshot.skipped.len() > snapshot.window as usize {
            return Err(ChainError::InvalidSnapshot {
                reason: format!(
                    "{} cached keys exceed window {}",
                    snapshot.skipped.len(),
                    snapshot.window
                ),
            });
        }
        if let Some(entry) = snapshot.skipped.iter().find(|entry| entry.index >= snapshot.index) {
            return Err(ChainError::InvalidSnapshot {
                reason: format!(
                    "cached index {} is not behind chain index {}",
                    entry.index, snapshot.index
                ),
            });
        }

        let mut step = Self::from_key(&snapshot.chain_key, snapshot.window)?;
        step.index = snapshot.index;
        step.skipped = snapshot
            .skipped
            .iter()
            .map(|entry| (entry.index, MessageKey { key: entry.key, index: entry.index }))
            .collect();
        step.dh_keys = snapshot.dh_secret.map(DhKeyPair::from_secret_bytes);
        Ok(step)
    }

    fn load_chain_key(&self) -> Result<Zeroizing<[u8; 32]>, ChainError> {
        let mut key = Zeroizing::new([0u8; 32]);
        self.chain_key.read(&mut key[..])?;
        Ok(key)
    }
}

impl std::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStep")
            .field("index", &self.index)
            .field("window", &self.window)
            .field("skipped", &self.skipped.len())
            .field("ratchet_capable", &self.dh_keys.is_some())
            .finish_non_exhaustive()
    }
}

/// Serializable chain step state. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainStepSnapshot {
    chain_key: [u8; 32],
    index: u32,
    window: u32,
    skipped: Vec<SkippedKey>,
    dh_secret: Option<[u8; 32]>,
}

impl ChainStepSnapshot {
    /// Next index the restored step will derive.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Number of cached skipped keys.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SkippedKey {
    index: u32,
    key: [u8; 32],
}

/// One KDF step: (message key, next chain key).
fn kdf_step(chain_key: &[u8; 32]) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    (hmac_label(chain_key, MESSAGE_LABEL), hmac_label(chain_key, CHAIN_LABEL))
}

fn hmac_label(chain_key: &[u8; 32], label: &[u8]) -> Zeroizing<[u8; 32]> {
    let Ok(mut mac) = HmacSha256::new_from_slice(chain_key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);

    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seed() -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        seed
    }

    fn step(window: u32) -> ChainStep {
        ChainStep::from_key(&test_seed(), window).unwrap()
    }

    #[test]
    fn new_step_starts_at_index_zero() {
        assert_eq!(step(10).index(), 0);
    }

    #[test]
    fn rejects_wrong_key_length() {
        let cell = SecureCell::allocate(16).unwrap();
        assert!(matches!(ChainStep::new(cell, 10), Err(ChainError::KeyDerivation { .. })));
    }

    #[test]
    fn sending_keys_are_sequential_and_unique() {
        let mut chain = step(10);

        let key0 = chain.next_sending_key().unwrap();
        let key1 = chain.next_sending_key().unwrap();
        let key2 = chain.next_sending_key().unwrap();

        assert_eq!((key0.index(), key1.index(), key2.index()), (0, 1, 2));
        assert_eq!(chain.index(), 3);
        assert_ne!(key0.key(), key1.key(), "keys must be unique");
        assert_ne!(key1.key(), key2.key(), "keys must be unique");
        assert_ne!(key0.key(), key2.key(), "keys must be unique");
        assert_eq!(chain.skipped_len(), 0);
    }

    #[test]
    fn chain_is_deterministic() {
        let mut a = step(10);
        let mut b = step(10);

        for _ in 0..10 {
            assert_eq!(a.next_sending_key().unwrap().key(), b.next_sending_key().unwrap().key());
        }
    }

    #[test]
    fn skip_matches_sequential() {
        let mut sequential = step(10);
        for _ in 0..5 {
            sequential.next_sending_key().unwrap();
        }
        let expected = sequential.next_sending_key().unwrap();

        let mut skipping = step(10);
        let key = skipping.derive_key(5).unwrap();

        assert_eq!(key.key(), expected.key(), "skip and sequential must produce same key");
        assert_eq!(skipping.index(), 6);
        assert_eq!(skipping.skipped_len(), 5);
    }

    #[test]
    fn reordered_keys_come_from_cache_once() {
        let mut reference = step(10);
        let expected: Vec<_> = (0..4).map(|_| reference.next_sending_key().unwrap()).collect();

        let mut chain = step(10);
        assert_eq!(chain.derive_key(3).unwrap().key(), expected[3].key());
        assert_eq!(chain.derive_key(1).unwrap().key(), expected[1].key());
        assert_eq!(chain.derive_key(0).unwrap().key(), expected[0].key());
        assert_eq!(chain.skipped_len(), 1);

        match chain.derive_key(1) {
            Err(ChainError::KeyNotFound { index, current }) => {
                assert_eq!(index, 1);
                assert_eq!(current, 4);
            },
            other => unreachable!("expected KeyNotFound, got {other:?}"),
        }
    }

    #[test]
    fn already_used_current_key_is_not_served_again() {
        let mut chain = step(10);
        chain.derive_key(0).unwrap();

        assert!(matches!(chain.derive_key(0), Err(ChainError::KeyNotFound { .. })));
    }

    #[test]
    fn gap_beyond_window_is_rejected() {
        let mut chain = step(10);

        match chain.derive_key(11) {
            Err(ChainError::MessageTooFarBehind { current, requested, window }) => {
                assert_eq!((current, requested, window), (0, 11, 10));
            },
            other => unreachable!("expected MessageTooFarBehind, got {other:?}"),
        }
        assert_eq!(chain.index(), 0, "failed derivation must not move the chain");

        // Exactly the window is fine
        assert!(chain.derive_key(10).is_ok());
    }

    #[test]
    fn cache_is_bounded_by_window() {
        let mut chain = step(4);
        chain.derive_key(4).unwrap();
        assert_eq!(chain.skipped_len(), 4);

        chain.derive_key(8).unwrap();
        assert!(chain.skipped_len() <= 4);

        // Index 0 fell out of the window and is gone for good
        assert!(matches!(chain.derive_key(0), Err(ChainError::KeyNotFound { .. })));
        assert!(chain.derive_key(5).is_ok());
    }

    #[test]
    fn index_ceiling_is_fatal() {
        let mut chain = step(10);
        chain.index = u32::MAX;

        let err = chain.next_sending_key().unwrap_err();
        assert!(matches!(err, ChainError::IndexOverflow { current: u32::MAX }));
        assert!(err.is_fatal());
    }

    #[test]
    fn far_ceiling_index_is_out_of_window() {
        let mut chain = step(10);
        chain.derive_key(2).unwrap();

        let err = chain.derive_key(u32::MAX).unwrap_err();
        assert!(matches!(
            err,
            ChainError::MessageTooFarBehind { current: 3, requested: u32::MAX, window: 10 }
        ));
        assert!(!err.is_fatal());
        assert_eq!(chain.index(), 3);
        assert!(chain.derive_key(3).is_ok());
    }

    #[test]
    fn ceiling_within_window_overflows() {
        let mut chain = step(10);
        chain.index = u32::MAX - 5;

        let err = chain.derive_key(u32::MAX).unwrap_err();
        assert!(matches!(err, ChainError::IndexOverflow { current } if current == u32::MAX - 5));
        assert_eq!(chain.index(), u32::MAX - 5);
    }

    #[test]
    fn fork_is_isolated() {
        let mut chain = step(10);
        chain.derive_key(2).unwrap();

        let mut fork = chain.fork().unwrap();
        fork.derive_key(0).unwrap();
        fork.derive_key(7).unwrap();

        assert_eq!(chain.index(), 3);
        assert_eq!(chain.skipped_len(), 2);

        let mut reference = step(10);
        let expected = reference.derive_key(7).unwrap();
        assert_eq!(chain.derive_key(7).unwrap().key(), expected.key());
    }

    #[test]
    fn reseed_resets_index_and_cache() {
        let mut chain = step(10);
        chain.derive_key(5).unwrap();

        chain.reseed(&[0x42; 32]).unwrap();
        assert_eq!(chain.index(), 0);
        assert_eq!(chain.skipped_len(), 0);

        let expected = ChainStep::from_key(&[0x42; 32], 10).unwrap().next_sending_key().unwrap();
        assert_eq!(chain.next_sending_key().unwrap().key(), expected.key());
    }

    #[test]
    fn snapshot_restores_same_sequence() {
        let mut chain = step(10);
        chain.derive_key(3).unwrap();

        let snapshot = chain.snapshot().unwrap();
        let mut restored = ChainStep::restore(&snapshot).unwrap();

        assert_eq!(restored.index(), 4);
        assert_eq!(restored.skipped_len(), 3);
        assert_eq!(restored.derive_key(1).unwrap().key(), chain.derive_key(1).unwrap().key());

        let restored_next = restored.next_sending_key().unwrap();
        let original_next = chain.next_sending_key().unwrap();
        assert_eq!(restored_next.key(), original_next.key());
    }

    #[test]
    fn restore_rejects_cache_ahead_of_index() {
        let mut snapshot = step(10).snapshot().unwrap();
        snapshot.skipped.push(SkippedKey { index: 0, key: [0; 32] });

        assert!(matches!(
            ChainStep::restore(&snapshot),
            Err(ChainError::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn released_step_fails_with_memory_error() {
        let mut chain = step(10);
        chain.release();

        let err = chain.next_sending_key().unwrap_err();
        assert!(matches!(err, ChainError::Memory(_)));
        assert!(err.is_fatal());
    }
}
