//! Retry and resilience policy engine.
//!
//! Every network call the client makes runs through [`ResilienceEngine`]:
//!
//! 1. Cancellation is checked, then the overall budget, then the connection's
//!    circuit breaker.
//! 2. The attempt runs under a per-attempt timeout. A timeout counts as
//!    `DeadlineExceeded`.
//! 3. The outcome is reported to the health manager and the breaker.
//! 4. Transient failures back off exponentially with jitter and retry; other
//!    failures return immediately as [`ResilienceError::Fatal`].
//!
//! [`ResilienceEngine::execute_with_recovery`] adds a second loop around
//! this: when the breaker is open it waits out the cool-down, re-establishes
//! the secure session and tries again.
//!
//! Waits use the [`Environment`] clock and never hold a lock.

#![allow(clippy::disallowed_types, reason = "Breaker map lock is never held across await")]

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use keyward_core::{Environment, FailureCategory, HealthManager, OperationKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    breaker::{BreakerConfig, CircuitBreaker},
    cancellation::Cancellation,
    transport::{TransportError, TransportErrorKind},
};

/// Attempts per call, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Backoff before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Upper bound on the pre-jitter backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Backoff growth per retry.
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Jitter as a fraction of the backoff, applied in both directions.
pub const DEFAULT_JITTER: f64 = 0.2;

/// Time allowed for one attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Session re-establishments attempted while the circuit is open.
pub const DEFAULT_SESSION_RECOVERY_ATTEMPTS: u32 = 2;

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Attempts per call, including the first (at least 1)
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on the pre-jitter backoff
    pub max_backoff: Duration,
    /// Backoff growth per retry
    pub multiplier: u32,
    /// Jitter fraction in [0, 1]
    pub jitter: f64,
    /// Time allowed for one attempt
    pub attempt_timeout: Duration,
    /// Total time allowed for a call, waits included
    pub budget: Option<Duration>,
    /// Session re-establishments attempted while the circuit is open
    pub session_recovery_attempts: u32,
    /// Circuit breaker applied per connection
    pub breaker: BreakerConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_JITTER,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            budget: None,
            session_recovery_attempts: DEFAULT_SESSION_RECOVERY_ATTEMPTS,
            breaker: BreakerConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based), jittered by `random`.
    ///
    /// The result lies in `base * [1 - jitter, 1 + jitter)` where `base` is
    /// `initial_backoff * multiplier^retry` capped at `max_backoff`.
    pub fn backoff(&self, retry: u32, random: u64) -> Duration {
        let growth = self.multiplier.max(1).saturating_pow(retry);
        let base = self.initial_backoff.saturating_mul(growth).min(self.max_backoff);

        let jitter = self.jitter.clamp(0.0, 1.0);
        // 53 random bits give a uniform f64 in [0, 1)
        let unit = (random >> 11) as f64 / (1u64 << 53) as f64;
        base.mul_f64(1.0 - jitter + 2.0 * jitter * unit)
    }
}

/// Terminal failure of a resilient call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Caller cancelled before the call could complete
    #[error("operation cancelled after {attempts} attempts")]
    OperationCancelled {
        /// Attempts dispatched before cancellation
        attempts: u32,
    },

    /// Every attempt failed transiently
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts dispatched
        attempts: u32,
        /// Failure of the final attempt
        last: TransportError,
    },

    /// Circuit breaker refused the attempt
    #[error("circuit open for connection {connect_id}, retry after {retry_after:?}")]
    CircuitOpen {
        /// Connection guarded by the breaker
        connect_id: u32,
        /// Remaining cool-down
        retry_after: Duration,
    },

    /// Overall time budget ran out
    #[error("retry budget of {budget:?} exhausted after {attempts} attempts")]
    BudgetExhausted {
        /// Configured budget
        budget: Duration,
        /// Attempts dispatched
        attempts: u32,
    },

    /// Non-transient failure, not retried
    #[error("non-retryable failure: {0}")]
    Fatal(TransportError),
}

impl ResilienceError {
    /// Health category of the failure.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::RetriesExhausted { last: error, .. } | Self::Fatal(error) => error.category,
            Self::CircuitOpen { .. } => FailureCategory::Connectivity,
            Self::BudgetExhausted { .. } => FailureCategory::Timeout,
            Self::OperationCancelled { .. } => FailureCategory::Unknown,
        }
    }

    /// Returns true if the caller may try again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted { .. } | Self::CircuitOpen { .. } | Self::BudgetExhausted { .. }
        )
    }
}

/// Retry engine shared by every connection of a client.
pub struct ResilienceEngine<E: Environment> {
    env: E,
    config: RetryConfig,
    health: Arc<HealthManager<E::Instant>>,
    breakers: Mutex<HashMap<u32, Arc<CircuitBreaker<E::Instant>>>>,
}

impl<E: Environment> ResilienceEngine<E> {
    /// Engine reporting outcomes to `health`. Breakers publish on the health
    /// manager's event stream.
    pub fn new(env: E, config: RetryConfig, health: Arc<HealthManager<E::Instant>>) -> Self {
        Self { env, config, health, breakers: Mutex::new(HashMap::new()) }
    }

    /// Environment supplying time and jitter.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Health manager receiving outcomes.
    pub fn health(&self) -> &Arc<HealthManager<E::Instant>> {
        &self.health
    }

    /// Breaker for `connect_id`, created closed on first use.
    pub fn breaker(&self, connect_id: u32) -> Arc<CircuitBreaker<E::Instant>> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(connect_id).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                connect_id,
                self.config.breaker,
                self.health.publisher().clone(),
            ))
        }))
    }

    /// Drop the breaker of a torn-down connection.
    pub fn forget(&self, connect_id: u32) {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner).remove(&connect_id);
    }

    /// Run `operation` with retries, timeouts and the circuit breaker.
    pub async fn execute<T, F, Fut>(
        &self,
        connect_id: u32,
        kind: OperationKind,
        cancel: &Cancellation,
        mut operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.run(connect_id, kind, cancel, &mut operation).await
    }

    /// Like [`ResilienceEngine::execute`], but an open circuit is waited out
    /// and `recover` re-establishes the session before each repeat, up to
    /// `session_recovery_attempts` times.
    ///
    /// A non-transient `recover` failure ends the call as
    /// [`ResilienceError::Fatal`].
    pub async fn execute_with_recovery<T, F, Fut, R, RFut>(
        &self,
        connect_id: u32,
        kind: OperationKind,
        cancel: &Cancellation,
        mut operation: F,
        mut recover: R,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = Result<(), TransportError>>,
    {
        let mut recoveries = 0;
        loop {
            let retry_after = match self.run(connect_id, kind, cancel, &mut operation).await {
                Err(ResilienceError::CircuitOpen { retry_after, .. })
                    if recoveries < self.config.session_recovery_attempts =>
                {
                    retry_after
                },
                outcome => return outcome,
            };

            recoveries += 1;
            info!(connect_id, recoveries, ?retry_after, "circuit open, waiting to recover session");
            self.pause(retry_after, cancel, 0).await?;

            match recover().await {
                Ok(()) => {
                    self.health.record_success(connect_id, OperationKind::Handshake, self.env.now());
                    debug!(connect_id, "session re-established");
                },
                Err(error) => {
                    self.health.record_failure(
                        connect_id,
                        OperationKind::Handshake,
                        error.category,
                        self.env.now(),
                    );
                    if !error.is_transient() {
                        warn!(connect_id, %error, "session recovery failed");
                        return Err(ResilienceError::Fatal(error));
                    }
                    debug!(connect_id, %error, "session recovery failed transiently");
                },
            }
        }
    }

    async fn run<T, F, Fut>(
        &self,
        connect_id: u32,
        kind: OperationKind,
        cancel: &Cancellation,
        operation: &mut F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let breaker = self.breaker(connect_id);
        let started = self.env.now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::OperationCancelled { attempts });
            }
            if let Some(budget) = self.config.budget
                && self.env.now() - started >= budget
            {
                return Err(ResilienceError::BudgetExhausted { budget, attempts });
            }
            if let Err(retry_after) = breaker.admit(self.env.now()) {
                debug!(connect_id, ?retry_after, "attempt refused by open circuit");
                return Err(ResilienceError::CircuitOpen { connect_id, retry_after });
            }

            attempts += 1;
            let error = match self.attempt(operation).await {
                Ok(value) => {
                    breaker.record_success();
                    self.health.record_success(connect_id, kind, self.env.now());
                    return Ok(value);
                },
                Err(error) => error,
            };

            let now = self.env.now();
            self.health.record_failure(connect_id, kind, error.category, now);
            if !error.is_transient() {
                breaker.release();
                warn!(connect_id, ?kind, %error, "non-retryable failure");
                return Err(ResilienceError::Fatal(error));
            }
            breaker.record_failure(now);

            if attempts >= max_attempts {
                warn!(connect_id, ?kind, attempts, %error, "retries exhausted");
                return Err(ResilienceError::RetriesExhausted { attempts, last: error });
            }

            let delay = self.config.backoff(attempts - 1, self.env.random_u64());
            if let Some(budget) = self.config.budget
                && now - started + delay >= budget
            {
                return Err(ResilienceError::BudgetExhausted { budget, attempts });
            }
            debug!(connect_id, ?kind, attempts, ?delay, %error, "retrying after backoff");
            self.pause(delay, cancel, attempts).await?;
        }
    }

    /// One attempt under the per-attempt timeout.
    async fn attempt<T, F, Fut>(&self, operation: &mut F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let timeout = self.config.attempt_timeout;
        tokio::select! {
            biased;
            result = operation() => result,
            () = self.env.sleep(timeout) => Err(TransportError::new(
                TransportErrorKind::DeadlineExceeded,
                format!("attempt timed out after {timeout:?}"),
            )),
        }
    }

    /// Wait for `duration` unless cancelled first.
    async fn pause(
        &self,
        duration: Duration,
        cancel: &Cancellation,
        attempts: u32,
    ) -> Result<(), ResilienceError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ResilienceError::OperationCancelled { attempts }),
            () = self.env.sleep(duration) => Ok(()),
        }
    }
}
