//! Storage abstraction for session snapshots
//!
//! Trait-based contract for persisting [`SessionSnapshot`]s. The trait is
//! synchronous (no async): saves happen on the caller's thread right after
//! the session operation that produced the milestone.

mod chaotic;
mod error;
mod memory;

pub use chaotic::ChaoticSnapshotStore;
pub use error::StorageError;
pub use memory::MemorySnapshotStore;

use crate::session::SessionSnapshot;

/// Why a snapshot is being saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveReason {
    /// Handshake completed
    SessionEstablished,
    /// Root key advanced
    DhRatchet,
    /// Peer acknowledged a rotation
    ChainSynchronized,
    /// Session finalized by a fatal error
    CriticalError,
    /// Periodic save after message traffic
    MessageThreshold,
}

/// Storage contract for session snapshots.
///
/// Must be Clone (shared by the persistence bridge and the registry), Send +
/// Sync (thread-safe), and synchronous. Implementations typically share
/// internal state via Arc, so clones access the same underlying storage.
///
/// Snapshots are keyed by `(connect_id, user_id)`; a save overwrites the
/// previous snapshot for that key.
pub trait SnapshotStore: Clone + Send + Sync + 'static {
    /// Persist `snapshot`, replacing any earlier one.
    fn save(
        &self,
        connect_id: u32,
        user_id: u64,
        snapshot: &SessionSnapshot,
        reason: SaveReason,
    ) -> Result<(), StorageError>;

    /// Load the latest snapshot, or `None` if nothing was saved for this
    /// key.
    fn load(&self, connect_id: u32, user_id: u64) -> Result<Option<SessionSnapshot>, StorageError>;

    /// Remove the snapshot. Deleting a missing snapshot is a no-op.
    fn delete(&self, connect_id: u32, user_id: u64) -> Result<(), StorageError>;
}
