//! Fuzz target for envelope and snapshot decoding
//!
//! Both arrive as CBOR from outside the process: envelopes from the
//! transport, snapshots from storage. Arbitrary bytes must decode to a value
//! or an error, never a panic.

#![no_main]

use keyward_core::{EncryptedEnvelope, SessionSnapshot};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = EncryptedEnvelope::from_bytes(data) {
        // Anything that decodes must re-encode
        let encoded = envelope.to_bytes().expect("decoded envelope should re-encode");
        let again = EncryptedEnvelope::from_bytes(&encoded).expect("re-encoded envelope");
        assert_eq!(again, envelope);
    }

    let _ = SessionSnapshot::from_bytes(data);
});
