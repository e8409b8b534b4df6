//! Property-based tests for chain steps
//!
//! These tests verify the fundamental invariants of per-direction ratchets:
//!
//! 1. **Monotonic index**: the chain index never decreases
//! 2. **Bounded cache**: skipped keys never exceed the window
//! 3. **Order independence**: any delivery order inside the window yields the
//!    same key per index as sequential derivation
//! 4. **Single use**: a key index is served at most once

use std::collections::HashSet;

use keyward_crypto::{ChainError, ChainStep};
use proptest::prelude::*;

const SEED: [u8; 32] = [0x11; 32];

fn sequential_keys(count: u32) -> Vec<[u8; 32]> {
    let mut chain = ChainStep::from_key(&SEED, count.max(1)).unwrap();
    (0..count).map(|_| *chain.next_sending_key().unwrap().key()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_index_is_monotonic_and_cache_bounded(
        window in 1u32..64,
        targets in prop::collection::vec(0u32..256, 1..64),
    ) {
        let mut chain = ChainStep::from_key(&SEED, window).unwrap();
        let mut previous = chain.index();

        for target in targets {
            let _ = chain.derive_key(target);

            prop_assert!(chain.index() >= previous, "index went backwards");
            prop_assert!(chain.skipped_len() <= window as usize, "cache exceeded window");
            previous = chain.index();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_any_order_matches_sequential(
        order in Just((0u32..32).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let expected = sequential_keys(32);
        let mut chain = ChainStep::from_key(&SEED, 32).unwrap();

        for index in order {
            let key = chain.derive_key(index).unwrap();
            prop_assert_eq!(key.key(), &expected[index as usize]);
        }

        prop_assert_eq!(chain.index(), 32);
        prop_assert_eq!(chain.skipped_len(), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_each_index_served_once(
        targets in prop::collection::vec(0u32..48, 1..96),
    ) {
        let mut chain = ChainStep::from_key(&SEED, 64).unwrap();
        let mut served = HashSet::new();

        for target in targets {
            match chain.derive_key(target) {
                Ok(key) => {
                    prop_assert!(served.insert(key.index()), "index {} served twice", key.index());
                },
                Err(ChainError::KeyNotFound { index, .. }) => {
                    prop_assert!(served.contains(&index), "unserved index {} reported missing", index);
                },
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_snapshot_preserves_future_keys(
        advance in 0u32..40,
        probe in 0u32..40,
    ) {
        let mut original = ChainStep::from_key(&SEED, 64).unwrap();
        if advance > 0 {
            original.derive_key(advance - 1).unwrap();
        }

        let mut restored = ChainStep::restore(&original.snapshot().unwrap()).unwrap();
        let target = original.index() + probe;

        let a = original.derive_key(target).unwrap();
        let b = restored.derive_key(target).unwrap();
        prop_assert_eq!(a.key(), b.key());
    }
}
