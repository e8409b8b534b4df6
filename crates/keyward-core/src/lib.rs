//! Keyward session core
//!
//! Sans-IO logic for client-side secure sessions: the protocol session state
//! machine, snapshot persistence policy, failure taxonomy and connection
//! health tracking. Nothing here opens sockets or spawns tasks; time and
//! randomness come from an [`Environment`], and outputs are events or return
//! values for the async driver in `keyward-client`.
//!
//! # Components
//!
//! - [`session`]: X3DH-established sessions with per-message chain steps, a
//!   DH ratchet and replay protection
//! - [`persistence`]: which session milestones are saved, and when
//! - [`storage`]: snapshot store contract with in-memory and fault-injecting
//!   implementations
//! - [`health`]: per-connection EWMA success tracking and status
//! - [`connectivity`]: broadcast stream of status and breaker events

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod connectivity;
pub mod env;
pub mod error;
pub mod failure;
pub mod health;
pub mod persistence;
pub mod session;
pub mod storage;

pub use connectivity::{ConnectivityEvent, EventPublisher};
pub use env::Environment;
pub use error::SessionError;
pub use failure::FailureCategory;
pub use health::{ConnectionStatus, HealthConfig, HealthManager, HealthSnapshot, OperationKind};
pub use persistence::{
    PersistOutcome, PersistenceBridge, PersistenceConfig, PersistenceDiagnostics, RestoreError,
};
pub use session::{
    EncryptedEnvelope, MessageHeader, ProtocolEvent, ProtocolSession, Role, SessionConfig,
    SessionSnapshot, SessionState,
};
pub use storage::{
    ChaoticSnapshotStore, MemorySnapshotStore, SaveReason, SnapshotStore, StorageError,
};
