//! Chaotic snapshot store for fault injection testing
//!
//! Store wrapper that randomly fails operations to test how the persistence
//! bridge absorbs storage failures without disturbing sessions.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex, PoisonError};

use super::{SaveReason, SnapshotStore, StorageError};
use crate::session::SessionSnapshot;

/// Default seed for [`ChaoticSnapshotStore::new`].
const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Snapshot store wrapper that randomly injects failures
///
/// Delegates to an underlying store but fails operations with probability
/// `failure_rate`. Clones share the RNG and the counters.
#[derive(Clone)]
pub struct ChaoticSnapshotStore<S: SnapshotStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// (attempted, injected failures)
    counters: Arc<Mutex<(usize, usize)>>,
}

/// Linear congruential generator, reproducible from its seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: SnapshotStore> ChaoticSnapshotStore<S> {
    /// Wrap `inner` with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            counters: Arc::new(Mutex::new((0, 0))),
        }
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of operations attempted.
    pub fn operation_count(&self) -> usize {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    /// Number of operations failed on purpose.
    pub fn injected_failures(&self) -> usize {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner).1
    }

    /// Count the operation and decide whether it fails.
    fn inject(&self) -> Result<(), StorageError> {
        let fail = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next() < self.failure_rate;

        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.0 += 1;
        if fail {
            counters.1 += 1;
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: SnapshotStore> SnapshotStore for ChaoticSnapshotStore<S> {
    fn save(
        &self,
        connect_id: u32,
        user_id: u64,
        snapshot: &SessionSnapshot,
        reason: SaveReason,
    ) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.save(connect_id, user_id, snapshot, reason)
    }

    fn load(
        &self,
        connect_id: u32,
        user_id: u64,
    ) -> Result<Option<SessionSnapshot>, StorageError> {
        self.inject()?;
        self.inner.load(connect_id, user_id)
    }

    fn delete(&self, connect_id: u32, user_id: u64) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.delete(connect_id, user_id)
    }
}
