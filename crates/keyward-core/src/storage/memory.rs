#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use zeroize::Zeroizing;

use super::{SaveReason, SnapshotStore, StorageError};
use crate::session::SessionSnapshot;

/// In-memory snapshot store for testing and simulation
///
/// Keeps every snapshot in its CBOR form, so a load exercises the same
/// decode path a durable store would. Encoded bytes are wiped when replaced
/// or dropped. Thread-safe through Mutex, but uses `lock().expect()` which
/// will panic if the mutex is poisoned - acceptable for test code.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<Mutex<MemorySnapshotStoreInner>>,
}

#[derive(Default)]
struct MemorySnapshotStoreInner {
    /// Encoded snapshot and the reason of the last save, per key
    snapshots: HashMap<(u32, u64), (Zeroizing<Vec<u8>>, SaveReason)>,

    /// Successful saves since creation
    save_count: usize,
}

impl MemorySnapshotStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").snapshots.len()
    }

    /// Whether no snapshot is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful saves since creation.
    #[allow(clippy::expect_used)]
    pub fn save_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").save_count
    }

    /// Reason recorded with the latest save for this key.
    #[allow(clippy::expect_used)]
    pub fn last_reason(&self, connect_id: u32, user_id: u64) -> Option<SaveReason> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.snapshots.get(&(connect_id, user_id)).map(|(_, reason)| *reason)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn save(
        &self,
        connect_id: u32,
        user_id: u64,
        snapshot: &SessionSnapshot,
        reason: SaveReason,
    ) -> Result<(), StorageError> {
        let bytes =
            snapshot.to_bytes().map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.snapshots.insert((connect_id, user_id), (bytes, reason));
        inner.save_count += 1;
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn load(
        &self,
        connect_id: u32,
        user_id: u64,
    ) -> Result<Option<SessionSnapshot>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some((bytes, _)) = inner.snapshots.get(&(connect_id, user_id)) else {
            return Ok(None);
        };

        SessionSnapshot::from_bytes(bytes)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn delete(&self, connect_id: u32, user_id: u64) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").snapshots.remove(&(connect_id, user_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::test_utils::MockEnv,
        session::{ProtocolSession, SessionConfig},
    };

    fn finalized_snapshot(connect_id: u32) -> SessionSnapshot {
        let mut session = ProtocolSession::new(MockEnv::with_seed(1), connect_id, SessionConfig::default());
        session.teardown();
        session.snapshot().unwrap()
    }

    #[test]
    fn load_missing_is_none() {
        let store = MemorySnapshotStore::new();

        assert!(matches!(store.load(1, 2), Ok(None)));
    }

    #[test]
    fn save_overwrites_per_key() {
        let store = MemorySnapshotStore::new();
        store.save(1, 2, &finalized_snapshot(1), SaveReason::SessionEstablished).unwrap();
        store.save(1, 2, &finalized_snapshot(1), SaveReason::CriticalError).unwrap();
        store.save(3, 2, &finalized_snapshot(3), SaveReason::DhRatchet).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.save_count(), 3);
        assert_eq!(store.last_reason(1, 2), Some(SaveReason::CriticalError));
        assert!(store.load(1, 2).unwrap().unwrap().finalized);
    }

    #[test]
    fn clones_share_state_and_delete_is_idempotent() {
        let store = MemorySnapshotStore::new();
        let clone = store.clone();
        store.save(1, 1, &finalized_snapshot(1), SaveReason::MessageThreshold).unwrap();

        assert_eq!(clone.len(), 1);
        clone.delete(1, 1).unwrap();
        clone.delete(1, 1).unwrap();
        assert!(store.is_empty());
    }
}
