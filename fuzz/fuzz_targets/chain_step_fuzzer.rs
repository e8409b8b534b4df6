//! Fuzz target for chain steps under adversarial delivery
//!
//! A sending and a receiving step share one chain key. The sender derives
//! keys in order; the receiver derives them in whatever order the fuzzer
//! picks, with duplicates, snapshots and restores in between.
//!
//! # Invariants
//!
//! - The receiver's key for index `n` equals the sender's key for `n`
//! - A key is handed out at most once
//! - The skipped-key cache never exceeds the window
//! - A failed derivation leaves the index and cache unchanged
//! - Snapshot then restore preserves index and cache size

#![no_main]

use std::collections::{HashMap, HashSet};

use arbitrary::Arbitrary;
use keyward_crypto::ChainStep;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Scenario {
    chain_key: [u8; 32],
    /// Window, kept small so pruning is exercised
    window: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Arbitrary)]
enum Operation {
    /// Sender derives its next key
    Send,
    /// Receiver derives the key at an index the sender produced
    Receive { pick: u16 },
    /// Receiver derives an index the sender may not have reached
    Jump { target: u32 },
    /// Receiver is rebuilt from a snapshot
    Restore,
}

fuzz_target!(|scenario: Scenario| {
    let window = u32::from(scenario.window);
    let Ok(mut sender) = ChainStep::from_key(&scenario.chain_key, window) else {
        return;
    };
    let Ok(mut receiver) = ChainStep::from_key(&scenario.chain_key, window) else {
        return;
    };

    let mut sent: HashMap<u32, [u8; 32]> = HashMap::new();
    let mut order: Vec<u32> = Vec::new();
    let mut handed_out: HashSet<u32> = HashSet::new();

    for operation in scenario.operations.into_iter().take(512) {
        match operation {
            Operation::Send => {
                let key = sender.next_sending_key().expect("sending key should derive");
                sent.insert(key.index(), *key.key());
                order.push(key.index());
            },
            Operation::Receive { pick } => {
                if order.is_empty() {
                    continue;
                }
                let index = order[usize::from(pick) % order.len()];
                derive_checked(&mut receiver, index, &sent, &mut handed_out);
            },
            Operation::Jump { target } => {
                derive_checked(&mut receiver, target, &sent, &mut handed_out);
            },
            Operation::Restore => {
                let snapshot = receiver.snapshot().expect("live step should snapshot");
                let restored = ChainStep::restore(&snapshot).expect("own snapshot should restore");
                assert_eq!(restored.index(), receiver.index());
                assert_eq!(restored.skipped_len(), receiver.skipped_len());
                receiver = restored;
            },
        }
        assert!(receiver.skipped_len() <= window as usize);
    }
});

fn derive_checked(
    receiver: &mut ChainStep,
    index: u32,
    sent: &HashMap<u32, [u8; 32]>,
    handed_out: &mut HashSet<u32>,
) {
    let before = (receiver.index(), receiver.skipped_len());
    match receiver.derive_key(index) {
        Ok(key) => {
            assert_eq!(key.index(), index);
            assert!(handed_out.insert(index), "index {index} handed out twice");
            if let Some(expected) = sent.get(&index) {
                assert_eq!(key.key(), expected, "chains disagree at {index}");
            }
        },
        Err(_) => {
            assert_eq!((receiver.index(), receiver.skipped_len()), before);
        },
    }
}
