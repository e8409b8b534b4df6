//! Per-connection circuit breaker.
//!
//! ```text
//!            threshold transient failures
//!   Closed ───────────────────────────────▶ Open
//!     ▲                                      │ cool-down elapsed
//!     │ trial succeeds                       ▼
//!     └──────────────────────────────── HalfOpen ──trial fails──▶ Open
//! ```
//!
//! Time is passed in by the caller, like the health manager, so the breaker
//! works with any [`keyward_core::Environment`] clock.

#![allow(clippy::disallowed_types, reason = "Breaker state is never held across await")]

use std::{
    ops::Sub,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use keyward_core::{ConnectivityEvent, EventPublisher};
use tracing::{debug, info, warn};

/// Consecutive transient failures that open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Time the circuit stays open before a trial attempt.
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(30);

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial attempt
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: DEFAULT_FAILURE_THRESHOLD, cool_down: DEFAULT_COOL_DOWN }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Attempts flow freely
    Closed,
    /// Attempts are rejected until the cool-down elapses
    Open,
    /// One trial attempt decides whether to close or reopen
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Phase<I> {
    Closed { failures: u32 },
    Open { since: I },
    HalfOpen { trial_in_flight: bool },
}

/// Breaker guarding one connection.
pub struct CircuitBreaker<I> {
    connect_id: u32,
    config: BreakerConfig,
    phase: Mutex<Phase<I>>,
    events: EventPublisher,
}

impl<I> CircuitBreaker<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Closed breaker for `connect_id`, publishing open/close on `events`.
    pub fn new(connect_id: u32, config: BreakerConfig, events: EventPublisher) -> Self {
        Self { connect_id, config, phase: Mutex::new(Phase::Closed { failures: 0 }), events }
    }

    /// Configuration in use.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// State as of `now`. An open breaker past its cool-down reports
    /// `HalfOpen`.
    pub fn state(&self, now: I) -> BreakerState {
        match *self.lock() {
            Phase::Closed { .. } => BreakerState::Closed,
            Phase::Open { since } if now - since < self.config.cool_down => BreakerState::Open,
            Phase::Open { .. } | Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Ask to dispatch an attempt.
    ///
    /// Returns the time to wait when the attempt must not be made. After the
    /// cool-down exactly one caller is admitted as the trial; others wait a
    /// full cool-down.
    pub fn admit(&self, now: I) -> Result<(), Duration> {
        let mut phase = self.lock();
        match *phase {
            Phase::Closed { .. } => Ok(()),
            Phase::Open { since } => {
                let elapsed = now - since;
                if elapsed < self.config.cool_down {
                    return Err(self.config.cool_down - elapsed);
                }
                debug!(connect_id = self.connect_id, "circuit half-open, admitting trial");
                *phase = Phase::HalfOpen { trial_in_flight: true };
                Ok(())
            },
            Phase::HalfOpen { trial_in_flight: true } => Err(self.config.cool_down),
            Phase::HalfOpen { trial_in_flight: false } => {
                *phase = Phase::HalfOpen { trial_in_flight: true };
                Ok(())
            },
        }
    }

    /// An admitted attempt succeeded.
    pub fn record_success(&self) {
        let mut phase = self.lock();
        let was_closed = matches!(*phase, Phase::Closed { .. });
        *phase = Phase::Closed { failures: 0 };
        drop(phase);

        if !was_closed {
            info!(connect_id = self.connect_id, "circuit closed");
            self.events.publish(ConnectivityEvent::CircuitClosed { connect_id: self.connect_id });
        }
    }

    /// An admitted attempt failed transiently.
    pub fn record_failure(&self, now: I) {
        let mut phase = self.lock();
        let opened = match *phase {
            Phase::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    *phase = Phase::Open { since: now };
                    true
                } else {
                    *phase = Phase::Closed { failures };
                    false
                }
            },
            Phase::HalfOpen { .. } => {
                *phase = Phase::Open { since: now };
                true
            },
            Phase::Open { .. } => false,
        };
        drop(phase);

        if opened {
            warn!(
                connect_id = self.connect_id,
                cool_down = ?self.config.cool_down,
                "circuit opened"
            );
            self.events.publish(ConnectivityEvent::CircuitOpen {
                connect_id: self.connect_id,
                retry_after: self.config.cool_down,
            });
        }
    }

    /// An admitted attempt ended without saying anything about reachability
    /// (non-transient failure or cancellation). Frees the half-open trial
    /// slot; a closed breaker keeps its failure streak.
    pub fn release(&self) {
        let mut phase = self.lock();
        if let Phase::HalfOpen { trial_in_flight: true } = *phase {
            *phase = Phase::HalfOpen { trial_in_flight: false };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase<I>> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn breaker() -> (CircuitBreaker<Instant>, tokio::sync::broadcast::Receiver<ConnectivityEvent>) {
        let events = EventPublisher::default();
        let receiver = events.subscribe();
        (CircuitBreaker::new(4, BreakerConfig::default(), events), receiver)
    }

    #[allow(clippy::disallowed_methods)]
    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn opens_at_threshold() {
        let (breaker, mut events) = breaker();
        let t0 = now();

        breaker.record_failure(t0);
        assert_eq!(breaker.state(t0), BreakerState::Closed);
        assert!(breaker.admit(t0).is_ok());

        breaker.record_failure(t0);
        assert_eq!(breaker.state(t0), BreakerState::Open);
        assert_eq!(breaker.admit(t0 + Duration::from_secs(10)), Err(Duration::from_secs(20)));
        assert_eq!(
            events.try_recv().expect("open event"),
            ConnectivityEvent::CircuitOpen { connect_id: 4, retry_after: DEFAULT_COOL_DOWN }
        );
    }

    #[test]
    fn success_resets_streak() {
        let (breaker, mut events) = breaker();
        let t0 = now();

        breaker.record_failure(t0);
        breaker.record_success();
        breaker.record_failure(t0);

        assert_eq!(breaker.state(t0), BreakerState::Closed);
        assert!(events.try_recv().is_err(), "no transitions, no events");
    }

    #[test]
    fn single_trial_after_cool_down() {
        let (breaker, _events) = breaker();
        let t0 = now();
        breaker.record_failure(t0);
        breaker.record_failure(t0);

        let later = t0 + DEFAULT_COOL_DOWN;
        assert_eq!(breaker.state(later), BreakerState::HalfOpen);
        assert!(breaker.admit(later).is_ok());
        assert_eq!(breaker.admit(later), Err(DEFAULT_COOL_DOWN));
    }

    #[test]
    fn trial_success_closes() {
        let (breaker, mut events) = breaker();
        let t0 = now();
        breaker.record_failure(t0);
        breaker.record_failure(t0);
        let _ = events.try_recv();

        breaker.admit(t0 + DEFAULT_COOL_DOWN).expect("trial should be admitted");
        breaker.record_success();

        assert_eq!(breaker.state(t0), BreakerState::Closed);
        assert_eq!(
            events.try_recv().expect("close event"),
            ConnectivityEvent::CircuitClosed { connect_id: 4 }
        );
    }

    #[test]
    fn trial_failure_reopens() {
        let (breaker, _events) = breaker();
        let t0 = now();
        breaker.record_failure(t0);
        breaker.record_failure(t0);

        let trial = t0 + DEFAULT_COOL_DOWN;
        breaker.admit(trial).expect("trial should be admitted");
        breaker.record_failure(trial);

        assert_eq!(breaker.state(trial), BreakerState::Open);
        assert_eq!(breaker.admit(trial), Err(DEFAULT_COOL_DOWN));
    }

    #[test]
    fn release_frees_trial_slot() {
        let (breaker, _events) = breaker();
        let t0 = now();
        breaker.record_failure(t0);
        breaker.record_failure(t0);

        let trial = t0 + DEFAULT_COOL_DOWN;
        breaker.admit(trial).expect("trial should be admitted");
        breaker.release();

        assert!(breaker.admit(trial).is_ok());
    }
}
