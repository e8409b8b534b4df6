//! Keyward client runtime
//!
//! Async glue around the sans-IO core: every transport call runs through the
//! retry engine and circuit breaker, sessions are owned by a registry that
//! serializes access per connection and persists milestones, and a
//! background task sweeps connection health.
//!
//! # Components
//!
//! - [`resilience`]: bounded retry with backoff, jitter, timeouts, budget and
//!   session recovery
//! - [`breaker`]: per-connection circuit breaker
//! - [`registry`]: session ownership behind the [`SessionLookup`] trait
//! - [`channel`]: sealed request/response over a [`Transport`]
//! - [`sweeper`]: periodic health sweep
//! - [`system_env`]: production [`keyward_core::Environment`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod breaker;
pub mod cancellation;
pub mod channel;
pub mod registry;
pub mod resilience;
pub mod sweeper;
pub mod system_env;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cancellation::Cancellation;
pub use channel::{ChannelError, SecureChannel};
pub use registry::{RegistryError, SessionLookup, SessionRegistry};
pub use resilience::{ResilienceEngine, ResilienceError, RetryConfig};
pub use sweeper::run_sweeper;
pub use system_env::SystemEnv;
pub use transport::{LoopbackTransport, Transport, TransportError, TransportErrorKind};
