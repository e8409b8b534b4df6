//! Protocol session state machine.
//!
//! A session owns one sending and one receiving [`ChainStep`] plus the root
//! key that reseeds them on every DH ratchet. It is sans-IO: randomness and
//! wall-clock time come from the [`Environment`], milestones are buffered as
//! [`ProtocolEvent`]s for the caller to drain.
//!
//! # State Machine
//!
//! ```text
//! ┌───────────────┐ begin_handshake ┌─────────────┐ establish ┌─────────────┐
//! │ Uninitialized │────────────────>│ Handshaking │──────────>│ Established │
//! └───────────────┘                 └─────────────┘           └─────────────┘
//!                                                       rotate │   ↑ peer ack
//!                                                              ↓   │
//!                                                         ┌─────────────┐
//!                                                         │ Ratcheting  │
//!                                                         └─────────────┘
//!            critical error / teardown (from any state)
//!                              ↓
//!                        ┌───────────┐
//!                        │ Finalized │
//!                        └───────────┘
//! ```
//!
//! # Ratchet
//!
//! Only the initiator rotates. A rotation mixes a fresh key pair against the
//! responder's ratchet key into the root key, reseeds both chains and moves
//! to the next epoch. Until the responder answers in that epoch, every
//! outgoing header carries the new public key. The responder performs the
//! mirrored ratchet on a staged copy and commits it only after the first
//! message of the new epoch authenticates.
//!
//! Messages from an older epoch are not decryptable once the epoch moves on.

mod envelope;
mod event;
mod replay;
mod snapshot;

pub use envelope::{EncryptedEnvelope, MessageHeader};
pub use event::ProtocolEvent;
use keyward_crypto::{
    ChainError, ChainStep, DEFAULT_WINDOW, DhKeyPair, HandshakeSecret, IdentityKeys,
    InitialMessage, MemoryError, NONCE_RANDOM_SIZE, OneTimePreKey, PreKeyBundle, PublicIdentity,
    SecureCell, SignedPreKey, build_nonce, decrypt_with_key, derive_root_keys,
    derive_session_keys, encrypt_with_key, handshake,
};
pub use replay::ReplayGuard;
use serde::{Deserialize, Serialize};
pub use snapshot::SessionSnapshot;
use snapshot::EstablishedSnapshot;
use tracing::{debug, error, info, trace};
use zeroize::Zeroizing;

use crate::{env::Environment, error::SessionError};

/// Messages sent before the initiator rotates its ratchet key automatically.
pub const DEFAULT_ROTATION_INTERVAL: u32 = 100;

/// Session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Look-ahead window for skipped keys and replay tracking
    pub window: u32,
    /// Sent messages between automatic rotations (0 disables)
    pub rotation_interval: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { window: DEFAULT_WINDOW, rotation_interval: DEFAULT_ROTATION_INTERVAL }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, no handshake started
    Uninitialized,
    /// Handshake in progress
    Handshaking,
    /// Chains seeded, no rotation outstanding
    Established,
    /// Local rotation performed, waiting for the peer to answer in the new
    /// epoch
    Ratcheting,
    /// Terminal; secrets released
    Finalized,
}

/// Which side of the handshake this session ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Fetched the peer bundle and sent the initial message
    Initiator,
    /// Published the bundle and answered the initial message
    Responder,
}

/// Key material of an established session.
struct ActiveKeys {
    role: Role,
    epoch: u32,
    root_key: SecureCell,
    /// Carries the local ratchet key pair
    sending: ChainStep,
    receiving: ChainStep,
    peer_ratchet: [u8; 32],
    peer_identity: PublicIdentity,
    associated_data: Vec<u8>,
    sent_since_rotation: u32,
    replay: ReplayGuard,
}

/// Root key and chains produced by a DH ratchet, not yet applied.
struct StagedRatchet {
    epoch: u32,
    root_key: SecureCell,
    sending: ChainStep,
    receiving: ChainStep,
}

/// Secure session for one connection.
pub struct ProtocolSession<E: Environment> {
    env: E,
    connect_id: u32,
    config: SessionConfig,
    state: SessionState,
    keys: Option<ActiveKeys>,
    events: Vec<ProtocolEvent>,
    recovering: bool,
}

impl<E: Environment> ProtocolSession<E> {
    /// Create an uninitialized session for `connect_id`.
    pub fn new(env: E, connect_id: u32, config: SessionConfig) -> Self {
        Self {
            env,
            connect_id,
            config,
            state: SessionState::Uninitialized,
            keys: None,
            events: Vec::new(),
            recovering: false,
        }
    }

    /// Connection this session belongs to.
    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handshake role, once established.
    pub fn role(&self) -> Option<Role> {
        self.keys.as_ref().map(|keys| keys.role)
    }

    /// Current ratchet epoch, once established.
    pub fn epoch(&self) -> Option<u32> {
        self.keys.as_ref().map(|keys| keys.epoch)
    }

    /// Next sending index, once established.
    pub fn sending_index(&self) -> Option<u32> {
        self.keys.as_ref().map(|keys| keys.sending.index())
    }

    /// Next receiving index in the current epoch, once established.
    pub fn receiving_index(&self) -> Option<u32> {
        self.keys.as_ref().map(|keys| keys.receiving.index())
    }

    /// Peer identity, once established.
    pub fn peer_identity(&self) -> Option<PublicIdentity> {
        self.keys.as_ref().map(|keys| keys.peer_identity)
    }

    /// True after a restore until the first message authenticates.
    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Take all buffered milestones.
    pub fn drain_events(&mut self) -> Vec<ProtocolEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start a handshake.
    pub fn begin_handshake(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Uninitialized => {
                self.state = SessionState::Handshaking;
                Ok(())
            },
            SessionState::Finalized => Err(SessionError::SessionFinalized),
            state => Err(SessionError::InvalidState { state, operation: "begin handshake" }),
        }
    }

    /// Run the initiator side of X3DH against `bundle` and establish.
    ///
    /// `pre_shared_key` is the export key of the authentication step, mixed
    /// into the handshake KDF when present.
    ///
    /// # Errors
    ///
    /// - `SessionError::PeerBundleMissing` if `bundle` is `None`
    /// - `SessionError::HandshakeFailed` if the bundle does not verify or a
    ///   DH output is non-contributory
    ///
    /// The session stays in `Handshaking` on handshake errors.
    pub fn initiate(
        &mut self,
        identity: &IdentityKeys,
        bundle: Option<&PreKeyBundle>,
        pre_shared_key: Option<&[u8]>,
    ) -> Result<InitialMessage, SessionError> {
        self.require_state(SessionState::Handshaking, "initiate")?;

        let (message, secret) =
            handshake::initiate(identity, bundle, pre_shared_key, &mut self.env.rng())?;
        self.establish(Role::Initiator, secret)?;
        Ok(message)
    }

    /// Run the responder side of X3DH for `message` and establish.
    pub fn accept(
        &mut self,
        identity: &IdentityKeys,
        signed_pre_key: &SignedPreKey,
        one_time_pre_key: Option<&OneTimePreKey>,
        message: &InitialMessage,
        pre_shared_key: Option<&[u8]>,
    ) -> Result<(), SessionError> {
        self.require_state(SessionState::Handshaking, "accept")?;

        let secret =
            handshake::respond(identity, signed_pre_key, one_time_pre_key, message, pre_shared_key)?;
        self.establish(Role::Responder, secret)
    }

    /// Seed both chains from a completed handshake.
    pub fn establish(&mut self, role: Role, secret: HandshakeSecret) -> Result<(), SessionError> {
        self.require_state(SessionState::Handshaking, "establish")?;

        let keys = match seed_keys(role, secret, self.config.window) {
            Ok(keys) => keys,
            Err(err) => return Err(self.fail(err.to_string())),
        };

        self.keys = Some(keys);
        self.state = SessionState::Established;
        self.events.push(ProtocolEvent::SessionEstablished { connect_id: self.connect_id });
        info!(connect_id = self.connect_id, ?role, "session established");
        Ok(())
    }

    /// Seal `plaintext` with the next sending key.
    ///
    /// Rotates first when the initiator has sent `rotation_interval` messages
    /// since the last rotation and no rotation is outstanding.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedEnvelope, SessionError> {
        self.require_active("encrypt")?;

        if self.rotation_due() {
            self.rotate_ratchet_key()?;
        }

        let connect_id = self.connect_id;
        let announcing = self.state == SessionState::Ratcheting;
        let Some(keys) = self.keys.as_mut() else {
            return Err(SessionError::InvalidState { state: self.state, operation: "encrypt" });
        };

        let message_key = match keys.sending.next_sending_key() {
            Ok(key) => key,
            Err(err) => return Err(self.fail(err.to_string())),
        };

        let header = MessageHeader {
            connect_id,
            epoch: keys.epoch,
            index: message_key.index(),
            ratchet_key: if announcing {
                keys.sending.dh_keys().map(DhKeyPair::public_bytes)
            } else {
                None
            },
        };

        let mut suffix = [0u8; NONCE_RANDOM_SIZE];
        self.env.random_bytes(&mut suffix);
        let nonce = build_nonce(connect_id, header.epoch, header.index, suffix);
        let aad = header.associated_data(&keys.associated_data);
        let ciphertext = encrypt_with_key(&message_key, &nonce, plaintext, &aad);

        keys.sent_since_rotation = keys.sent_since_rotation.saturating_add(1);
        self.events.push(ProtocolEvent::MessageSent {
            connect_id,
            epoch: header.epoch,
            index: header.index,
        });
        trace!(connect_id, epoch = header.epoch, index = header.index, "message sealed");

        Ok(EncryptedEnvelope { header, nonce, ciphertext })
    }

    /// Authenticate and open `envelope`.
    ///
    /// # Errors
    ///
    /// - `ReplayDetected` if the index was already consumed this epoch
    /// - `KeyNotFound` for evicted indices and other epochs
    /// - `MessageTooFarBehind` if the index is beyond the window
    /// - `DecryptionFailed` if authentication fails
    ///
    /// All of the above leave the session unchanged. `CriticalError`
    /// finalizes it.
    pub fn decrypt(&mut self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, SessionError> {
        self.require_active("decrypt")?;

        let header = envelope.header;
        if header.connect_id != self.connect_id {
            return Err(SessionError::ConnectionMismatch {
                expected: self.connect_id,
                actual: header.connect_id,
            });
        }

        let window = self.config.window;
        let Some(keys) = self.keys.as_mut() else {
            return Err(SessionError::InvalidState { state: self.state, operation: "decrypt" });
        };
        let epoch = keys.epoch;

        let plaintext = if header.epoch == epoch {
            if keys.replay.is_consumed(header.index) {
                debug!(connect_id = self.connect_id, epoch, index = header.index, "replay rejected");
                return Err(SessionError::ReplayDetected { epoch, index: header.index });
            }

            let mut staged = match keys.receiving.fork() {
                Ok(step) => step,
                Err(err) => return Err(self.fail(err.to_string())),
            };
            let plaintext = match open(&mut staged, envelope, &keys.associated_data) {
                Ok(plaintext) => plaintext,
                Err(err) => return Err(self.reject(err, epoch)),
            };

            keys.receiving = staged;
            keys.replay.mark(header.index);

            if self.state == SessionState::Ratcheting && keys.role == Role::Initiator {
                self.state = SessionState::Established;
                self.events
                    .push(ProtocolEvent::ChainSynchronized { connect_id: self.connect_id, epoch });
                debug!(connect_id = self.connect_id, epoch, "rotation acknowledged");
            }
            plaintext
        } else if let (Some(next), Role::Responder, Some(peer_key)) =
            (epoch.checked_add(1), keys.role, header.ratchet_key)
            && next == header.epoch
        {
            let Some(local) = keys.sending.dh_keys().cloned() else {
                return Err(self.fail("ratchet key pair missing"));
            };
            let Some(dh_output) = local.diffie_hellman(&peer_key) else {
                return Err(SessionError::DecryptionFailed);
            };

            let mut staged = match stage_ratchet(keys, &dh_output, local, false, window) {
                Ok(staged) => staged,
                Err(err) => return Err(self.fail(err.to_string())),
            };
            let plaintext = match open(&mut staged.receiving, envelope, &keys.associated_data) {
                Ok(plaintext) => plaintext,
                Err(err) => return Err(self.reject(err, header.epoch)),
            };

            commit(keys, staged, peer_key);
            keys.replay.mark(header.index);
            self.events.push(ProtocolEvent::DhRatchetPerformed {
                connect_id: self.connect_id,
                epoch: header.epoch,
            });
            debug!(connect_id = self.connect_id, epoch = header.epoch, "followed peer ratchet");
            plaintext
        } else {
            debug!(
                connect_id = self.connect_id,
                current = epoch,
                requested = header.epoch,
                "message from unavailable epoch"
            );
            return Err(SessionError::KeyNotFound { epoch: header.epoch, index: header.index });
        };

        self.recovering = false;
        self.events.push(ProtocolEvent::MessageReceived {
            connect_id: self.connect_id,
            epoch: header.epoch,
            index: header.index,
        });
        Ok(plaintext)
    }

    /// Replace the local ratchet key pair and reseed both chains.
    ///
    /// # Errors
    ///
    /// - `RotationNotPermitted` on the responder
    /// - `RotationPending` while a previous rotation is unacknowledged
    pub fn rotate_ratchet_key(&mut self) -> Result<(), SessionError> {
        let Some(keys) = self.keys.as_ref() else {
            return Err(match self.state {
                SessionState::Finalized => SessionError::SessionFinalized,
                state => SessionError::InvalidState { state, operation: "rotate ratchet key" },
            });
        };
        if keys.role != Role::Initiator {
            return Err(SessionError::RotationNotPermitted);
        }
        if self.state == SessionState::Ratcheting {
            return Err(SessionError::RotationPending { epoch: keys.epoch });
        }

        let fresh = DhKeyPair::generate(&mut self.env.rng());
        let Some(dh_output) = fresh.diffie_hellman(&keys.peer_ratchet) else {
            return Err(self.fail("peer ratchet key is non-contributory"));
        };
        let peer_ratchet = keys.peer_ratchet;

        let staged = match stage_ratchet(keys, &dh_output, fresh, true, self.config.window) {
            Ok(staged) => staged,
            Err(err) => return Err(self.fail(err.to_string())),
        };
        let epoch = staged.epoch;

        if let Some(keys) = self.keys.as_mut() {
            commit(keys, staged, peer_ratchet);
        }
        self.state = SessionState::Ratcheting;
        self.events.push(ProtocolEvent::DhRatchetPerformed { connect_id: self.connect_id, epoch });
        debug!(connect_id = self.connect_id, epoch, "ratchet key rotated");
        Ok(())
    }

    /// Capture the session for persistence.
    ///
    /// A finalized session yields a key-less marker.
    pub fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let saved_at_secs = self.env.wall_clock_secs();

        let keys = match (self.state, &self.keys) {
            (SessionState::Finalized, _) => None,
            (SessionState::Established | SessionState::Ratcheting, Some(keys)) => {
                Some(capture(keys, self.state == SessionState::Ratcheting).map_err(|err| {
                    SessionError::Snapshot { reason: err.to_string() }
                })?)
            },
            (state, _) => return Err(SessionError::InvalidState { state, operation: "snapshot" }),
        };

        Ok(SessionSnapshot {
            connect_id: self.connect_id,
            finalized: keys.is_none(),
            recovering: self.recovering,
            saved_at_secs,
            keys,
        })
    }

    /// Rebuild a session from a snapshot. The session starts recovering.
    ///
    /// # Errors
    ///
    /// - `SessionFinalized` if the snapshot marks a finalized session
    /// - `Snapshot` if the key material is missing or inconsistent
    pub fn restore(
        env: E,
        snapshot: &SessionSnapshot,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        if snapshot.finalized {
            return Err(SessionError::SessionFinalized);
        }
        let Some(saved) = &snapshot.keys else {
            return Err(SessionError::Snapshot {
                reason: "snapshot carries no key material".to_string(),
            });
        };
        if saved.replay.epoch() != saved.epoch {
            return Err(SessionError::Snapshot {
                reason: format!(
                    "replay guard epoch {} does not match session epoch {}",
                    saved.replay.epoch(),
                    saved.epoch
                ),
            });
        }

        let invalid = |err: ChainError| SessionError::Snapshot { reason: err.to_string() };
        let sending = ChainStep::restore(&saved.sending).map_err(invalid)?;
        let receiving = ChainStep::restore(&saved.receiving).map_err(invalid)?;
        if sending.dh_keys().is_none() {
            return Err(SessionError::Snapshot {
                reason: "sending chain has no ratchet key pair".to_string(),
            });
        }
        let root_key = SecureCell::from_slice(&saved.root_key)
            .map_err(|err| SessionError::Snapshot { reason: err.to_string() })?;

        let state =
            if saved.awaiting_ack { SessionState::Ratcheting } else { SessionState::Established };
        info!(connect_id = snapshot.connect_id, epoch = saved.epoch, "session restored");

        Ok(Self {
            env,
            connect_id: snapshot.connect_id,
            config,
            state,
            keys: Some(ActiveKeys {
                role: saved.role,
                epoch: saved.epoch,
                root_key,
                sending,
                receiving,
                peer_ratchet: saved.peer_ratchet,
                peer_identity: saved.peer_identity,
                associated_data: saved.associated_data.clone(),
                sent_since_rotation: saved.sent_since_rotation,
                replay: saved.replay.clone(),
            }),
            events: Vec::new(),
            recovering: true,
        })
    }

    /// Release all secrets and finalize. Idempotent.
    pub fn teardown(&mut self) {
        self.release_keys();
        if self.state != SessionState::Finalized {
            self.state = SessionState::Finalized;
            debug!(connect_id = self.connect_id, "session torn down");
        }
    }

    fn rotation_due(&self) -> bool {
        let interval = self.config.rotation_interval;
        self.state == SessionState::Established
            && interval > 0
            && self
                .keys
                .as_ref()
                .is_some_and(|keys| keys.role == Role::Initiator && keys.sent_since_rotation >= interval)
    }

    fn require_state(
        &self,
        expected: SessionState,
        operation: &'static str,
    ) -> Result<(), SessionError> {
        match self.state {
            state if state == expected => Ok(()),
            SessionState::Finalized => Err(SessionError::SessionFinalized),
            state => Err(SessionError::InvalidState { state, operation }),
        }
    }

    fn require_active(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.state {
            SessionState::Established | SessionState::Ratcheting => Ok(()),
            SessionState::Finalized => Err(SessionError::SessionFinalized),
            state => Err(SessionError::InvalidState { state, operation }),
        }
    }

    /// Map a receive-path chain error, finalizing on fatal ones.
    fn reject(&mut self, err: ChainError, epoch: u32) -> SessionError {
        match SessionError::from_chain(err, epoch) {
            SessionError::CriticalError { reason } => self.fail(reason),
            rejection => {
                debug!(connect_id = self.connect_id, error = %rejection, "message rejected");
                rejection
            },
        }
    }

    /// Finalize after a fatal error.
    fn fail(&mut self, reason: impl Into<String>) -> SessionError {
        let reason = reason.into();
        error!(connect_id = self.connect_id, %reason, "session finalized by critical error");

        self.release_keys();
        self.state = SessionState::Finalized;
        self.events.push(ProtocolEvent::CriticalError {
            connect_id: self.connect_id,
            reason: reason.clone(),
        });
        SessionError::CriticalError { reason }
    }

    fn release_keys(&mut self) {
        if let Some(mut keys) = self.keys.take() {
            keys.sending.release();
            keys.receiving.release();
            keys.root_key.release();
        }
    }
}

impl<E: Environment> std::fmt::Debug for ProtocolSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("connect_id", &self.connect_id)
            .field("state", &self.state)
            .field("epoch", &self.epoch())
            .field("recovering", &self.recovering)
            .finish_non_exhaustive()
    }
}

fn seed_keys(role: Role, secret: HandshakeSecret, window: u32) -> Result<ActiveKeys, ChainError> {
    let seeded = derive_session_keys(&secret.shared_secret[..]);
    let (sending_key, receiving_key) = match role {
        Role::Initiator => (&seeded.initiator_chain, &seeded.responder_chain),
        Role::Responder => (&seeded.responder_chain, &seeded.initiator_chain),
    };

    Ok(ActiveKeys {
        role,
        epoch: 0,
        root_key: SecureCell::from_slice(&seeded.root_key[..])?,
        sending: ChainStep::from_key(sending_key, window)?.with_dh_keys(secret.local_ratchet),
        receiving: ChainStep::from_key(receiving_key, window)?,
        peer_ratchet: secret.peer_ratchet,
        peer_identity: secret.peer_identity,
        associated_data: secret.associated_data,
        sent_since_rotation: 0,
        replay: ReplayGuard::new(0, window),
    })
}

/// Derive the next epoch's root key and chains without touching `keys`.
///
/// The side that generated the fresh key pair sends on the ratcheting chain;
/// the observing side receives on it.
fn stage_ratchet(
    keys: &ActiveKeys,
    dh_output: &[u8; 32],
    local: DhKeyPair,
    rotating_locally: bool,
    window: u32,
) -> Result<StagedRatchet, ChainError> {
    let epoch = keys.epoch.checked_add(1).ok_or_else(|| ChainError::KeyDerivation {
        reason: "ratchet epoch exhausted".to_string(),
    })?;

    let root_key = read_secret(&keys.root_key)?;
    let derived = derive_root_keys(&root_key, dh_output);
    let (sending_key, receiving_key) = if rotating_locally {
        (&derived.ratcheting_chain, &derived.observing_chain)
    } else {
        (&derived.observing_chain, &derived.ratcheting_chain)
    };

    Ok(StagedRatchet {
        epoch,
        root_key: SecureCell::from_slice(&derived.root_key[..])?,
        sending: ChainStep::from_key(sending_key, window)?.with_dh_keys(local),
        receiving: ChainStep::from_key(receiving_key, window)?,
    })
}

/// Apply a staged ratchet. Replaced cells are wiped as they drop.
fn commit(keys: &mut ActiveKeys, staged: StagedRatchet, peer_ratchet: [u8; 32]) {
    keys.epoch = staged.epoch;
    keys.root_key = staged.root_key;
    keys.sending = staged.sending;
    keys.receiving = staged.receiving;
    keys.peer_ratchet = peer_ratchet;
    keys.sent_since_rotation = 0;
    keys.replay.reset(staged.epoch);
}

fn open(
    step: &mut ChainStep,
    envelope: &EncryptedEnvelope,
    session_ad: &[u8],
) -> Result<Vec<u8>, ChainError> {
    let message_key = step.derive_key(envelope.header.index)?;
    let aad = envelope.header.associated_data(session_ad);
    decrypt_with_key(&message_key, &envelope.nonce, &envelope.ciphertext, &aad)
}

fn capture(keys: &ActiveKeys, awaiting_ack: bool) -> Result<EstablishedSnapshot, ChainError> {
    Ok(EstablishedSnapshot {
        role: keys.role,
        epoch: keys.epoch,
        root_key: *read_secret(&keys.root_key)?,
        sending: keys.sending.snapshot()?,
        receiving: keys.receiving.snapshot()?,
        peer_ratchet: keys.peer_ratchet,
        peer_identity: keys.peer_identity,
        associated_data: keys.associated_data.clone(),
        awaiting_ack,
        sent_since_rotation: keys.sent_since_rotation,
        replay: keys.replay.clone(),
    })
}

fn read_secret(cell: &SecureCell) -> Result<Zeroizing<[u8; 32]>, MemoryError> {
    let mut key = Zeroizing::new([0u8; 32]);
    cell.read(&mut key[..])?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use keyward_crypto::{HandshakeError, IdentityKeys, OneTimePreKey, PreKeyBundle, SignedPreKey};

    use super::*;
    use crate::env::test_utils::MockEnv;

    type Session = ProtocolSession<MockEnv>;

    fn config(rotation_interval: u32) -> SessionConfig {
        SessionConfig { window: 64, rotation_interval }
    }

    fn pair_with(env: &MockEnv, config: SessionConfig) -> (Session, Session) {
        let alice = IdentityKeys::generate(&mut env.rng());
        let bob = IdentityKeys::generate(&mut env.rng());
        let signed = SignedPreKey::generate(&bob, 1, &mut env.rng());
        let one_time = OneTimePreKey::generate(9, &mut env.rng());
        let bundle = PreKeyBundle::new(&bob, &signed, Some(&one_time));

        let mut initiator = Session::new(env.clone(), 7, config);
        let mut responder = Session::new(env.clone(), 7, config);
        initiator.begin_handshake().unwrap();
        responder.begin_handshake().unwrap();

        let message = initiator.initiate(&alice, Some(&bundle), None).unwrap();
        responder.accept(&bob, &signed, Some(&one_time), &message, None).unwrap();
        (initiator, responder)
    }

    fn pair() -> (Session, Session) {
        pair_with(&MockEnv::with_seed(42), config(0))
    }

    #[test]
    fn new_session_is_uninitialized() {
        let session = Session::new(MockEnv::with_seed(1), 3, SessionConfig::default());

        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(session.epoch(), None);
        assert!(!session.is_recovering());
    }

    #[test]
    fn encrypt_before_establish_is_invalid_state() {
        let mut session = Session::new(MockEnv::with_seed(1), 3, SessionConfig::default());

        let result = session.encrypt(b"early");
        assert!(matches!(
            result,
            Err(SessionError::InvalidState { state: SessionState::Uninitialized, .. })
        ));
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let (mut initiator, mut responder) = pair();

        assert_eq!(initiator.state(), SessionState::Established);
        assert_eq!(responder.state(), SessionState::Established);
        assert_eq!(initiator.role(), Some(Role::Initiator));
        assert_eq!(responder.role(), Some(Role::Responder));
        assert_eq!(
            initiator.drain_events(),
            vec![ProtocolEvent::SessionEstablished { connect_id: 7 }]
        );
    }

    #[test]
    fn missing_bundle_keeps_handshaking() {
        let env = MockEnv::with_seed(5);
        let identity = IdentityKeys::generate(&mut env.rng());
        let mut session = Session::new(env, 1, SessionConfig::default());
        session.begin_handshake().unwrap();

        assert_eq!(session.initiate(&identity, None, None), Err(SessionError::PeerBundleMissing));
        assert_eq!(session.state(), SessionState::Handshaking);
    }

    #[test]
    fn tampered_bundle_fails_handshake() {
        let env = MockEnv::with_seed(6);
        let alice = IdentityKeys::generate(&mut env.rng());
        let bob = IdentityKeys::generate(&mut env.rng());
        let signed = SignedPreKey::generate(&bob, 1, &mut env.rng());
        let mut bundle = PreKeyBundle::new(&bob, &signed, None);
        bundle.signed_pre_key[0] ^= 1;

        let mut session = Session::new(env, 1, SessionConfig::default());
        session.begin_handshake().unwrap();

        assert_eq!(
            session.initiate(&alice, Some(&bundle), None),
            Err(SessionError::HandshakeFailed(HandshakeError::InvalidSignature))
        );
    }

    #[test]
    fn messages_flow_both_ways() {
        let (mut initiator, mut responder) = pair();

        let envelope = initiator.encrypt(b"hello").unwrap();
        assert_eq!(responder.decrypt(&envelope).unwrap(), b"hello");

        let reply = responder.encrypt(b"hi back").unwrap();
        assert_eq!(initiator.decrypt(&reply).unwrap(), b"hi back");

        assert_eq!(initiator.sending_index(), Some(1));
        assert_eq!(responder.receiving_index(), Some(1));
    }

    #[test]
    fn out_of_order_delivery() {
        let (mut initiator, mut responder) = pair();
        let envelopes: Vec<_> = (0..5u8).map(|i| initiator.encrypt(&[i]).unwrap()).collect();

        for index in [3usize, 0, 4, 1, 2] {
            assert_eq!(responder.decrypt(&envelopes[index]).unwrap(), vec![index as u8]);
        }
    }

    #[test]
    fn replay_is_rejected() {
        let (mut initiator, mut responder) = pair();
        let envelope = initiator.encrypt(b"once").unwrap();

        responder.decrypt(&envelope).unwrap();
        assert_eq!(
            responder.decrypt(&envelope),
            Err(SessionError::ReplayDetected { epoch: 0, index: 0 })
        );
        assert_eq!(responder.state(), SessionState::Established);
    }

    #[test]
    fn tampered_ciphertext_leaves_state_untouched() {
        let (mut initiator, mut responder) = pair();
        let envelope = initiator.encrypt(b"payload").unwrap();

        let mut tampered = envelope.clone();
        tampered.ciphertext[0] ^= 0x80;

        assert_eq!(responder.decrypt(&tampered), Err(SessionError::DecryptionFailed));
        assert_eq!(responder.receiving_index(), Some(0));
        assert_eq!(responder.decrypt(&envelope).unwrap(), b"payload");
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let (mut initiator, mut responder) = pair();
        initiator.encrypt(b"zero").unwrap();
        let mut envelope = initiator.encrypt(b"one").unwrap();
        envelope.header.index = 0;

        assert_eq!(responder.decrypt(&envelope), Err(SessionError::DecryptionFailed));
    }

    #[test]
    fn gap_beyond_window_is_rejected() {
        let (mut initiator, mut responder) = pair();
        let mut envelope = initiator.encrypt(b"far").unwrap();
        envelope.header.index = 500;

        assert!(matches!(
            responder.decrypt(&envelope),
            Err(SessionError::MessageTooFarBehind { requested: 500, window: 64, .. })
        ));
    }

    #[test]
    fn forged_ceiling_index_does_not_finalize() {
        let (mut initiator, mut responder) = pair();
        let genuine = initiator.encrypt(b"genuine").unwrap();
        let mut forged = genuine.clone();
        forged.header.index = u32::MAX;

        let err = responder.decrypt(&forged).unwrap_err();
        assert!(matches!(err, SessionError::MessageTooFarBehind { requested: u32::MAX, .. }));
        assert!(!err.is_fatal());
        assert_eq!(responder.state(), SessionState::Established);
        assert_eq!(responder.decrypt(&genuine).unwrap(), b"genuine");
    }

    #[test]
    fn wrong_connection_is_rejected() {
        let (mut initiator, mut responder) = pair();
        let mut envelope = initiator.encrypt(b"x").unwrap();
        envelope.header.connect_id = 99;

        assert_eq!(
            responder.decrypt(&envelope),
            Err(SessionError::ConnectionMismatch { expected: 7, actual: 99 })
        );
    }

    #[test]
    fn rotation_reseeds_and_is_followed() {
        let (mut initiator, mut responder) = pair();
        initiator.drain_events();
        responder.drain_events();

        initiator.rotate_ratchet_key().unwrap();
        assert_eq!(initiator.state(), SessionState::Ratcheting);
        assert_eq!(initiator.epoch(), Some(1));
        assert_eq!(initiator.sending_index(), Some(0));

        let envelope = initiator.encrypt(b"new epoch").unwrap();
        assert!(envelope.header.ratchet_key.is_some());
        assert_eq!(responder.decrypt(&envelope).unwrap(), b"new epoch");
        assert_eq!(responder.epoch(), Some(1));
        assert!(
            responder
                .drain_events()
                .contains(&ProtocolEvent::DhRatchetPerformed { connect_id: 7, epoch: 1 })
        );

        let reply = responder.encrypt(b"ack").unwrap();
        assert_eq!(initiator.decrypt(&reply).unwrap(), b"ack");
        assert_eq!(initiator.state(), SessionState::Established);
        assert!(
            initiator
                .drain_events()
                .contains(&ProtocolEvent::ChainSynchronized { connect_id: 7, epoch: 1 })
        );

        let next = initiator.encrypt(b"settled").unwrap();
        assert!(next.header.ratchet_key.is_none());
        assert_eq!(responder.decrypt(&next).unwrap(), b"settled");
    }

    #[test]
    fn second_rotation_before_ack_is_pending() {
        let (mut initiator, _responder) = pair();
        initiator.rotate_ratchet_key().unwrap();

        assert_eq!(initiator.rotate_ratchet_key(), Err(SessionError::RotationPending { epoch: 1 }));
    }

    #[test]
    fn responder_cannot_rotate() {
        let (_initiator, mut responder) = pair();

        assert_eq!(responder.rotate_ratchet_key(), Err(SessionError::RotationNotPermitted));
    }

    #[test]
    fn forged_ratchet_message_does_not_advance_epoch() {
        let (mut initiator, mut responder) = pair();
        initiator.rotate_ratchet_key().unwrap();

        let mut forged = initiator.encrypt(b"ratchet").unwrap();
        forged.ciphertext[3] ^= 1;

        assert_eq!(responder.decrypt(&forged), Err(SessionError::DecryptionFailed));
        assert_eq!(responder.epoch(), Some(0));
    }

    #[test]
    fn old_epoch_messages_are_lost() {
        let (mut initiator, mut responder) = pair();
        let stale = initiator.encrypt(b"before").unwrap();

        initiator.rotate_ratchet_key().unwrap();
        responder.decrypt(&initiator.encrypt(b"after").unwrap()).unwrap();

        assert_eq!(responder.decrypt(&stale), Err(SessionError::KeyNotFound { epoch: 0, index: 0 }));
    }

    #[test]
    fn automatic_rotation_after_interval() {
        let (mut initiator, mut responder) = pair_with(&MockEnv::with_seed(3), config(3));

        for _ in 0..3 {
            let envelope = initiator.encrypt(b"m").unwrap();
            assert_eq!(envelope.header.epoch, 0);
            responder.decrypt(&envelope).unwrap();
        }

        let rotated = initiator.encrypt(b"m").unwrap();
        assert_eq!(rotated.header.epoch, 1);
        assert_eq!(initiator.state(), SessionState::Ratcheting);
        responder.decrypt(&rotated).unwrap();
    }

    #[test]
    fn snapshot_restore_resumes_conversation() {
        let env = MockEnv::with_seed(11);
        let (mut initiator, mut responder) = pair_with(&env, config(0));
        responder.decrypt(&initiator.encrypt(b"one").unwrap()).unwrap();
        let pending = initiator.encrypt(b"two").unwrap();

        let bytes = responder.snapshot().unwrap().to_bytes().unwrap();
        drop(responder);
        let snapshot = SessionSnapshot::from_bytes(&bytes).unwrap();
        let mut restored = Session::restore(env, &snapshot, config(0)).unwrap();

        assert!(restored.is_recovering());
        assert_eq!(restored.decrypt(&pending).unwrap(), b"two");
        assert!(!restored.is_recovering());

        let reply = restored.encrypt(b"three").unwrap();
        assert_eq!(initiator.decrypt(&reply).unwrap(), b"three");
    }

    #[test]
    fn restored_session_still_rejects_replays() {
        let env = MockEnv::with_seed(12);
        let (mut initiator, mut responder) = pair_with(&env, config(0));
        let envelope = initiator.encrypt(b"once").unwrap();
        responder.decrypt(&envelope).unwrap();

        let snapshot = responder.snapshot().unwrap();
        let mut restored = Session::restore(env, &snapshot, config(0)).unwrap();

        assert!(matches!(restored.decrypt(&envelope), Err(SessionError::ReplayDetected { .. })));
    }

    #[test]
    fn teardown_finalizes_and_snapshots_as_marker() {
        let (mut initiator, _responder) = pair();
        initiator.teardown();
        initiator.teardown();

        assert_eq!(initiator.state(), SessionState::Finalized);
        assert_eq!(initiator.encrypt(b"late"), Err(SessionError::SessionFinalized));

        let snapshot = initiator.snapshot().unwrap();
        assert!(snapshot.finalized);
        assert!(matches!(
            Session::restore(MockEnv::with_seed(1), &snapshot, config(0)),
            Err(SessionError::SessionFinalized)
        ));
    }

    #[test]
    fn snapshot_before_establish_is_invalid() {
        let session = Session::new(MockEnv::with_seed(1), 1, SessionConfig::default());

        assert!(matches!(session.snapshot(), Err(SessionError::InvalidState { .. })));
    }
}
