//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). Enables
//! deterministic simulation (virtual clock, seeded RNG) and production use
//! with real system resources.

use std::time::Duration;

use rand::{CryptoRng, RngCore};

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, while simulation
    /// environments use virtual time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - This method MUST return values that never decrease within a single
    ///   execution context. Subsequent calls must return times >= previous
    ///   calls.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait, and it should only be used
    /// by driver code (retry backoff, sweeps), never by protocol logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Seconds since the Unix epoch, for snapshot timestamps.
    fn wall_clock_secs(&self) -> u64;

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Borrow the environment as a [`RngCore`] for key generation.
    fn rng(&self) -> EnvRng<'_, Self>
    where
        Self: Sized,
    {
        EnvRng { env: self }
    }
}

/// [`RngCore`] view over an [`Environment`].
///
/// Marked [`CryptoRng`] because `Environment::random_bytes` must be
/// cryptographically secure in production.
pub struct EnvRng<'a, E> {
    env: &'a E,
}

impl<E: Environment> RngCore for EnvRng<'_, E> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.env.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        self.env.random_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.env.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.env.random_bytes(dest);
        Ok(())
    }
}

impl<E: Environment> CryptoRng for EnvRng<'_, E> {}

/// Deterministic environment for tests and simulation.
pub mod test_utils {
    #![allow(clippy::disallowed_types, reason = "Locking simple RNG and clock state")]

    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    /// Unix time reported by a fresh [`MockEnv`].
    const MOCK_EPOCH_SECS: u64 = 1_700_000_000;

    /// Virtual clock plus seeded RNG.
    ///
    /// `sleep` advances the virtual clock when first polled and completes
    /// immediately, so retry and cool-down paths run instantly while still
    /// observing elapsed time. A sleep that loses a race is never polled and
    /// leaves the clock alone. Clones share the clock and RNG.
    #[derive(Clone)]
    pub struct MockEnv {
        base: Instant,
        offset: Arc<Mutex<Duration>>,
        rng: Arc<Mutex<ChaCha20Rng>>,
    }

    impl MockEnv {
        /// Environment seeded with `seed`.
        #[allow(clippy::disallowed_methods)]
        pub fn with_seed(seed: u64) -> Self {
            Self {
                base: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
                rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            }
        }

        /// Environment with a fixed default seed and a CSPRNG stream.
        pub fn with_crypto_rng() -> Self {
            Self::with_seed(0x6b65_7977_6172_6400)
        }

        /// Move the virtual clock forward.
        pub fn advance(&self, duration: Duration) {
            *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += duration;
        }

        /// Total virtual time elapsed since creation.
        pub fn elapsed(&self) -> Duration {
            *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl Environment for MockEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.base + self.elapsed()
        }

        fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            let offset = Arc::clone(&self.offset);
            async move {
                *offset.lock().unwrap_or_else(PoisonError::into_inner) += duration;
            }
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
        }

        fn wall_clock_secs(&self) -> u64 {
            MOCK_EPOCH_SECS + self.elapsed().as_secs()
        }
    }
}
