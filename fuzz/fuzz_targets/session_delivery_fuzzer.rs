//! Fuzz target for protocol session delivery
//!
//! An established initiator/responder pair exchange messages; the fuzzer
//! controls direction, delivery order, duplication, tampering and ratchet
//! rotation.
//!
//! # Invariants
//!
//! - No delivery sequence panics
//! - An envelope opens at most once
//! - A tampered envelope never opens
//! - An opened envelope yields the plaintext it was sealed with

#![no_main]

use arbitrary::Arbitrary;
use keyward_core::{
    EncryptedEnvelope, Environment, ProtocolSession, SessionConfig, env::test_utils::MockEnv,
};
use keyward_crypto::{IdentityKeys, PreKeyBundle, SignedPreKey};
use libfuzzer_sys::fuzz_target;

type Session = ProtocolSession<MockEnv>;

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    /// Initiator rotation interval (0 disables rotation)
    rotation_interval: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Arbitrary)]
enum Operation {
    /// Seal a message in one direction
    Send { from_initiator: bool, plaintext: Vec<u8> },
    /// Deliver a previously sealed message
    Deliver { pick: u16 },
    /// Deliver a previously sealed message with one ciphertext byte flipped
    Tamper { pick: u16, position: u16, mask: u8 },
}

struct InFlight {
    to_initiator: bool,
    envelope: EncryptedEnvelope,
    plaintext: Vec<u8>,
    opened: bool,
}

fuzz_target!(|scenario: Scenario| {
    let config = SessionConfig {
        rotation_interval: u32::from(scenario.rotation_interval),
        ..SessionConfig::default()
    };
    let Some((mut initiator, mut responder)) = establish(scenario.seed, config) else {
        return;
    };
    let mut in_flight: Vec<InFlight> = Vec::new();

    for operation in scenario.operations.into_iter().take(256) {
        match operation {
            Operation::Send { from_initiator, plaintext } => {
                let sender = if from_initiator { &mut initiator } else { &mut responder };
                if let Ok(envelope) = sender.encrypt(&plaintext) {
                    in_flight.push(InFlight {
                        to_initiator: !from_initiator,
                        envelope,
                        plaintext,
                        opened: false,
                    });
                }
            },
            Operation::Deliver { pick } => {
                if in_flight.is_empty() {
                    continue;
                }
                let message = &mut in_flight[usize::from(pick) % in_flight.len()];
                let receiver = if message.to_initiator { &mut initiator } else { &mut responder };
                if let Ok(plaintext) = receiver.decrypt(&message.envelope) {
                    assert!(!message.opened, "envelope opened twice");
                    assert_eq!(plaintext, message.plaintext);
                    message.opened = true;
                }
            },
            Operation::Tamper { pick, position, mask } => {
                if in_flight.is_empty() || mask == 0 {
                    continue;
                }
                let message = &in_flight[usize::from(pick) % in_flight.len()];
                if message.envelope.ciphertext.is_empty() {
                    continue;
                }
                let mut tampered = message.envelope.clone();
                let position = usize::from(position) % tampered.ciphertext.len();
                tampered.ciphertext[position] ^= mask;

                let receiver = if message.to_initiator { &mut initiator } else { &mut responder };
                assert!(receiver.decrypt(&tampered).is_err(), "tampered envelope opened");
            },
        }
    }
});

fn establish(seed: u64, config: SessionConfig) -> Option<(Session, Session)> {
    let env = MockEnv::with_seed(seed);
    let alice = IdentityKeys::generate(&mut env.rng());
    let bob = IdentityKeys::generate(&mut env.rng());
    let signed = SignedPreKey::generate(&bob, 1, &mut env.rng());
    let bundle = PreKeyBundle::new(&bob, &signed, None);

    let mut initiator = Session::new(env.clone(), 1, config);
    let mut responder = Session::new(env, 1, config);
    initiator.begin_handshake().ok()?;
    responder.begin_handshake().ok()?;
    let message = initiator.initiate(&alice, Some(&bundle), None).ok()?;
    responder.accept(&bob, &signed, None, &message, None).ok()?;
    Some((initiator, responder))
}
