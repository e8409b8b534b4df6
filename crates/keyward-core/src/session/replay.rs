//! Consumed-index tracking for the current receiving epoch.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Set of message indices already accepted in one receiving epoch.
///
/// Indices older than `highest - window` are pruned; the receiving chain
/// can no longer derive keys for them, so they fail as missing keys rather
/// than as replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayGuard {
    epoch: u32,
    window: u32,
    consumed: BTreeSet<u32>,
}

impl ReplayGuard {
    /// Empty guard for `epoch`.
    pub fn new(epoch: u32, window: u32) -> Self {
        Self { epoch, window, consumed: BTreeSet::new() }
    }

    /// Epoch this guard covers.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Whether `index` was already accepted.
    pub fn is_consumed(&self, index: u32) -> bool {
        self.consumed.contains(&index)
    }

    /// Number of tracked indices.
    pub fn len(&self) -> usize {
        self.consumed.len()
    }

    /// Whether no index is tracked.
    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty()
    }

    /// Record an accepted index and prune entries outside the window.
    pub fn mark(&mut self, index: u32) {
        self.consumed.insert(index);

        if let Some(&highest) = self.consumed.last() {
            let floor = highest.saturating_sub(self.window);
            self.consumed = self.consumed.split_off(&floor);
        }
    }

    /// Start tracking a new epoch.
    pub fn reset(&mut self, epoch: u32) {
        self.epoch = epoch;
        self.consumed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_index_is_consumed() {
        let mut guard = ReplayGuard::new(0, 10);
        assert!(!guard.is_consumed(4));

        guard.mark(4);
        assert!(guard.is_consumed(4));
        assert!(!guard.is_consumed(5));
    }

    #[test]
    fn prunes_outside_window() {
        let mut guard = ReplayGuard::new(0, 5);
        for index in 0..20 {
            guard.mark(index);
        }

        assert_eq!(guard.len(), 6);
        assert!(!guard.is_consumed(14));
        assert!(guard.is_consumed(15));
    }

    #[test]
    fn reset_clears_and_moves_epoch() {
        let mut guard = ReplayGuard::new(0, 5);
        guard.mark(1);
        guard.reset(1);

        assert_eq!(guard.epoch(), 1);
        assert!(guard.is_empty());
    }
}
