//! Fuzz target for the chunked asymmetric codec
//!
//! # Invariants
//!
//! - Arbitrary blobs decrypt to a value or an error, never a panic
//! - Blobs that are not a whole number of ciphertext chunks are rejected
//! - Sealing then opening returns the plaintext for any length
//! - Flipping any byte of a sealed blob makes opening fail

#![no_main]

use arbitrary::Arbitrary;
use keyward_crypto::{
    ChunkDecryptor, CodecError, DhKeyPair, SealedBoxDecryptor, decrypt_chunked, encrypt_chunked,
};
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    plaintext: Vec<u8>,
    flip: Option<(u16, u8)>,
    raw: Vec<u8>,
}

fuzz_target!(|scenario: Scenario| {
    let mut rng = ChaCha20Rng::seed_from_u64(scenario.seed);
    let keys = SealedBoxDecryptor::new(DhKeyPair::generate(&mut rng));

    match decrypt_chunked(&keys, &scenario.raw) {
        Err(CodecError::MisalignedCiphertext { .. }) => {
            assert_ne!(scenario.raw.len() % keys.ciphertext_chunk_size(), 0);
        },
        Ok(_) | Err(_) => {},
    }

    let sealed = encrypt_chunked(&keys.encryptor(), &scenario.plaintext, &mut rng)
        .expect("sealing should succeed");
    let opened = decrypt_chunked(&keys, &sealed).expect("opening should succeed");
    assert_eq!(opened, scenario.plaintext);

    if let Some((position, mask)) = scenario.flip
        && mask != 0
        && !sealed.is_empty()
    {
        let mut tampered = sealed;
        let position = usize::from(position) % tampered.len();
        tampered[position] ^= mask;
        assert!(decrypt_chunked(&keys, &tampered).is_err(), "tampered blob must not open");
    }
});
