//! Chain steps: per-direction symmetric ratchets with a bounded skipped-key
//! window, plus the root KDF and message sealing they feed.

mod derivation;
mod encryption;
mod step;

pub use derivation::{RootKeys, SessionKeys, derive_root_keys, derive_session_keys};
pub use encryption::{NONCE_RANDOM_SIZE, build_nonce, decrypt_with_key, encrypt_with_key};
pub use step::{ChainStep, ChainStepSnapshot, DEFAULT_WINDOW, MessageKey};
