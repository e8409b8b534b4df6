//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` backs sessions, retry waits and the health sweeper with real
//! resources:
//!
//! - Real system time (`std::time::Instant`) that advances naturally
//! - OS cryptographic RNG (getrandom). Truly random, not reproducible
//! - Tokio async sleep for backoff, cool-down and sweep delays

use std::time::Duration;

use keyward_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Security
///
/// Ephemeral ratchet keys, X3DH key pairs and message nonces all draw from
/// this RNG, which is the OS CSPRNG (e.g. /dev/urandom on Linux,
/// `BCryptGenRandom` on Windows).
///
/// # Panics
///
/// Panics if the OS RNG fails. A client without functioning randomness would
/// reuse nonces and produce predictable ratchet keys, so there is nothing
/// safe to fall back to.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - keys and nonces would repeat");
    }

    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs()
    }
}
