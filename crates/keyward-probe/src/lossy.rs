//! Transport that loses requests.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use keyward_client::{Transport, TransportError, TransportErrorKind};
use keyward_core::Environment;

/// Drops a fraction of requests before they reach the inner transport.
///
/// Dropped requests fail as `Unavailable`, so the retry engine resends them.
/// Responses are never lost: a lost response would make the retry a replay
/// the peer correctly refuses.
pub struct LossyTransport<T, E> {
    inner: T,
    env: E,
    loss_rate: f64,
    dropped: AtomicU64,
}

impl<T: Transport, E: Environment> LossyTransport<T, E> {
    /// Wrap `inner`, dropping requests with probability `loss_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `loss_rate` is not in [0.0, 1.0].
    pub fn new(inner: T, env: E, loss_rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&loss_rate), "loss_rate must be in [0.0, 1.0]");
        Self { inner, env, loss_rate, dropped: AtomicU64::new(0) }
    }

    /// Requests dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn should_drop(&self) -> bool {
        let roll = (self.env.random_u64() >> 11) as f64 / (1u64 << 53) as f64;
        roll < self.loss_rate
    }
}

#[async_trait]
impl<T: Transport, E: Environment> Transport for LossyTransport<T, E> {
    async fn call(&self, connect_id: u32, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if self.should_drop() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(connect_id, "request lost in transit");
            return Err(TransportError::new(TransportErrorKind::Unavailable, "request lost"));
        }
        self.inner.call(connect_id, request).await
    }
}
