//! Protocol state persistence bridge.
//!
//! Turns session milestones into snapshot saves. Key milestones (session
//! established, DH ratchet, chain synchronized, critical error) are saved
//! synchronously before the caller continues; message traffic is saved on a
//! best-effort schedule of every `save_every_n_messages` messages.
//!
//! Save failures never reach the caller of the session operation. They come
//! back as [`PersistOutcome::Failed`], are logged, and are counted in
//! [`PersistenceDiagnostics`].

#![allow(clippy::disallowed_types, reason = "Short critical sections over counters")]

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    env::Environment,
    error::SessionError,
    session::{ProtocolEvent, ProtocolSession, SessionConfig},
    storage::{SaveReason, SnapshotStore, StorageError},
};

/// Messages between best-effort saves.
pub const DEFAULT_SAVE_EVERY_N_MESSAGES: u32 = 1;

/// Persistence configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Message events between best-effort saves (0 disables message saves)
    pub save_every_n_messages: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { save_every_n_messages: DEFAULT_SAVE_EVERY_N_MESSAGES }
    }
}

impl SaveReason {
    /// Key milestones are saved synchronously; message traffic is not.
    pub fn is_immediate(self) -> bool {
        !matches!(self, Self::MessageThreshold)
    }

    /// Higher wins when several milestones are drained together.
    fn priority(self) -> u8 {
        match self {
            Self::CriticalError => 4,
            Self::DhRatchet => 3,
            Self::SessionEstablished => 2,
            Self::ChainSynchronized => 1,
            Self::MessageThreshold => 0,
        }
    }
}

/// Save reason for a milestone.
pub fn save_reason(event: &ProtocolEvent) -> SaveReason {
    match event {
        ProtocolEvent::SessionEstablished { .. } => SaveReason::SessionEstablished,
        ProtocolEvent::DhRatchetPerformed { .. } => SaveReason::DhRatchet,
        ProtocolEvent::ChainSynchronized { .. } => SaveReason::ChainSynchronized,
        ProtocolEvent::CriticalError { .. } => SaveReason::CriticalError,
        ProtocolEvent::MessageSent { .. } | ProtocolEvent::MessageReceived { .. } => {
            SaveReason::MessageThreshold
        },
    }
}

/// Result of persisting one batch of milestones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// No milestones were pending
    Idle,
    /// Message traffic below the save threshold
    Deferred,
    /// Snapshot written
    Saved {
        /// Most urgent reason in the batch
        reason: SaveReason,
    },
    /// Snapshot could not be produced or written
    Failed {
        /// Most urgent reason in the batch
        reason: SaveReason,
        /// Underlying failure
        error: StorageError,
    },
}

/// Counters describing persistence health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceDiagnostics {
    /// Snapshots written
    pub saves: u64,
    /// Batches left for a later save
    pub deferred: u64,
    /// Failed saves of key milestones
    pub critical_failures: u64,
    /// Failed best-effort saves
    pub best_effort_failures: u64,
}

/// Errors restoring a session from storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RestoreError {
    /// Store failed or had no snapshot
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Snapshot was rejected by the session
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Default)]
struct BridgeState {
    /// Message events since the last successful save, per connection
    pending_messages: HashMap<u32, u32>,
    diagnostics: PersistenceDiagnostics,
}

/// Applies the save policy for one user's sessions.
pub struct PersistenceBridge<S: SnapshotStore> {
    store: S,
    user_id: u64,
    config: PersistenceConfig,
    state: Mutex<BridgeState>,
}

impl<S: SnapshotStore> PersistenceBridge<S> {
    /// Bridge saving into `store` on behalf of `user_id`.
    pub fn new(store: S, user_id: u64, config: PersistenceConfig) -> Self {
        Self { store, user_id, config, state: Mutex::new(BridgeState::default()) }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current counters.
    pub fn diagnostics(&self) -> PersistenceDiagnostics {
        self.lock().diagnostics
    }

    /// Drain the session's milestones and save if the policy asks for it.
    ///
    /// At most one snapshot is written per call, tagged with the most urgent
    /// reason in the batch.
    pub fn persist<E: Environment>(&self, session: &mut ProtocolSession<E>) -> PersistOutcome {
        let events = session.drain_events();
        if events.is_empty() {
            return PersistOutcome::Idle;
        }

        let connect_id = session.connect_id();
        let Some(reason) = self.decide(connect_id, &events) else {
            self.lock().diagnostics.deferred += 1;
            return PersistOutcome::Deferred;
        };

        let result = session
            .snapshot()
            .map_err(|e| StorageError::Serialization(e.to_string()))
            .and_then(|snapshot| self.store.save(connect_id, self.user_id, &snapshot, reason));

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.pending_messages.remove(&connect_id);
                state.diagnostics.saves += 1;
                debug!(connect_id, ?reason, "session snapshot saved");
                PersistOutcome::Saved { reason }
            },
            Err(error) => {
                if reason.is_immediate() {
                    state.diagnostics.critical_failures += 1;
                    error!(connect_id, ?reason, %error, "failed to save session milestone");
                } else {
                    state.diagnostics.best_effort_failures += 1;
                    warn!(connect_id, %error, "best-effort session save failed");
                }
                PersistOutcome::Failed { reason, error }
            },
        }
    }

    /// Load and restore the latest session for `connect_id`.
    ///
    /// A missing snapshot is reported as `StorageError::NotFound`.
    pub fn restore<E: Environment>(
        &self,
        env: E,
        connect_id: u32,
        config: SessionConfig,
    ) -> Result<ProtocolSession<E>, RestoreError> {
        let user_id = self.user_id;
        let snapshot = self
            .store
            .load(connect_id, user_id)?
            .ok_or(StorageError::NotFound { connect_id, user_id })?;
        Ok(ProtocolSession::restore(env, &snapshot, config)?)
    }

    /// Drop the stored snapshot and counters for a torn-down connection.
    pub fn discard(&self, connect_id: u32) {
        self.lock().pending_messages.remove(&connect_id);
        if let Err(error) = self.store.delete(connect_id, self.user_id) {
            warn!(connect_id, %error, "failed to delete session snapshot");
        }
    }

    /// Most urgent save reason for a batch, or `None` to defer.
    fn decide(&self, connect_id: u32, events: &[ProtocolEvent]) -> Option<SaveReason> {
        let mut state = self.lock();
        let pending = state.pending_messages.entry(connect_id).or_insert(0);

        let mut decided: Option<SaveReason> = None;
        for event in events {
            let reason = save_reason(event);
            if !reason.is_immediate() {
                *pending = pending.saturating_add(1);
                let threshold = self.config.save_every_n_messages;
                if threshold == 0 || *pending < threshold {
                    continue;
                }
            }
            if decided.is_none_or(|current| reason.priority() > current.priority()) {
                decided = Some(reason);
            }
        }
        decided
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::test_utils::MockEnv, storage::MemorySnapshotStore};

    #[test]
    fn milestones_are_immediate_messages_are_not() {
        assert!(save_reason(&ProtocolEvent::DhRatchetPerformed { connect_id: 1, epoch: 1 }).is_immediate());
        assert!(save_reason(&ProtocolEvent::CriticalError { connect_id: 1, reason: String::new() }).is_immediate());
        assert!(!save_reason(&ProtocolEvent::MessageSent { connect_id: 1, epoch: 0, index: 0 }).is_immediate());
    }

    #[test]
    fn idle_without_events() {
        let bridge = PersistenceBridge::new(MemorySnapshotStore::new(), 1, PersistenceConfig::default());
        let mut session = ProtocolSession::new(MockEnv::with_seed(1), 1, SessionConfig::default());

        assert_eq!(bridge.persist(&mut session), PersistOutcome::Idle);
    }

    #[test]
    fn restore_without_snapshot_is_not_found() {
        let bridge = PersistenceBridge::new(MemorySnapshotStore::new(), 5, PersistenceConfig::default());

        let restore = bridge.restore(MockEnv::with_seed(1), 2, SessionConfig::default());
        assert!(matches!(restore, Err(RestoreError::Storage(StorageError::NotFound { .. }))));
    }
}
