//! Session registry.
//!
//! Owns every live [`ProtocolSession`] of a client, serializes operations per
//! connection and forwards session milestones to the persistence bridge after
//! each operation. Consumers depend on the [`SessionLookup`] trait rather
//! than on the registry, so tests and alternative owners can be injected.

#![allow(clippy::disallowed_types, reason = "Session locks are never held across await")]

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use keyward_core::{
    Environment, PersistenceBridge, ProtocolSession, RestoreError, SessionConfig, SessionError,
    SnapshotStore,
};
use keyward_crypto::{IdentityKeys, InitialMessage, OneTimePreKey, PreKeyBundle, SignedPreKey};
use thiserror::Error;
use tracing::info;

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No session is registered for the connection
    #[error("no session for connection {connect_id}")]
    UnknownSession {
        /// Connection that was looked up
        connect_id: u32,
    },

    /// A session is already registered for the connection
    #[error("session for connection {connect_id} already exists")]
    AlreadyRegistered {
        /// Connection that was registered twice
        connect_id: u32,
    },

    /// Session operation failed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Session could not be restored from storage
    #[error(transparent)]
    Restore(#[from] RestoreError),
}

impl RegistryError {
    /// Returns true if the session behind the connection is unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Session(error) => error.is_fatal(),
            Self::Restore(_) | Self::UnknownSession { .. } => true,
            Self::AlreadyRegistered { .. } => false,
        }
    }
}

/// Access to sessions by connection id.
pub trait SessionLookup<E: Environment>: Send + Sync {
    /// Run `operation` on the session for `connect_id` with exclusive access.
    fn with_session<R>(
        &self,
        connect_id: u32,
        operation: impl FnOnce(&mut ProtocolSession<E>) -> Result<R, SessionError>,
    ) -> Result<R, RegistryError>;

    /// Returns true if a session exists for `connect_id`.
    fn contains(&self, connect_id: u32) -> bool;
}

type SharedSession<E> = Arc<Mutex<ProtocolSession<E>>>;

/// Owner of a client's live sessions.
pub struct SessionRegistry<E: Environment, S: SnapshotStore> {
    env: E,
    config: SessionConfig,
    bridge: PersistenceBridge<S>,
    sessions: Mutex<HashMap<u32, SharedSession<E>>>,
}

impl<E: Environment, S: SnapshotStore> SessionRegistry<E, S> {
    /// Empty registry persisting through `bridge`.
    pub fn new(env: E, config: SessionConfig, bridge: PersistenceBridge<S>) -> Self {
        Self { env, config, bridge, sessions: Mutex::new(HashMap::new()) }
    }

    /// Persistence bridge in use.
    pub fn bridge(&self) -> &PersistenceBridge<S> {
        &self.bridge
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Returns true if no sessions are live.
    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Live connection ids, in no particular order.
    pub fn connect_ids(&self) -> Vec<u32> {
        lock(&self.sessions).keys().copied().collect()
    }

    /// Establish an initiator session for `connect_id` against `bundle`.
    pub fn initiate(
        &self,
        connect_id: u32,
        identity: &IdentityKeys,
        bundle: Option<&PreKeyBundle>,
        pre_shared_key: Option<&[u8]>,
    ) -> Result<InitialMessage, RegistryError> {
        self.ensure_vacant(connect_id)?;
        let mut session = ProtocolSession::new(self.env.clone(), connect_id, self.config);
        session.begin_handshake()?;
        let message = session.initiate(identity, bundle, pre_shared_key)?;
        self.insert(session)?;
        Ok(message)
    }

    /// Establish a responder session for `connect_id` from `message`.
    pub fn accept(
        &self,
        connect_id: u32,
        identity: &IdentityKeys,
        signed_pre_key: &SignedPreKey,
        one_time_pre_key: Option<&OneTimePreKey>,
        message: &InitialMessage,
        pre_shared_key: Option<&[u8]>,
    ) -> Result<(), RegistryError> {
        self.ensure_vacant(connect_id)?;
        let mut session = ProtocolSession::new(self.env.clone(), connect_id, self.config);
        session.begin_handshake()?;
        session.accept(identity, signed_pre_key, one_time_pre_key, message, pre_shared_key)?;
        self.insert(session)
    }

    /// Restore the saved session for `connect_id`.
    pub fn restore(&self, connect_id: u32) -> Result<(), RegistryError> {
        self.ensure_vacant(connect_id)?;
        let session = self.bridge.restore(self.env.clone(), connect_id, self.config)?;
        self.insert(session)
    }

    /// Register an established session and persist its pending milestones.
    ///
    /// A rejected duplicate is dropped without touching storage, so the live
    /// session's snapshot is never overwritten.
    pub fn insert(&self, session: ProtocolSession<E>) -> Result<(), RegistryError> {
        let connect_id = session.connect_id();
        let shared = {
            let mut sessions = lock(&self.sessions);
            let Entry::Vacant(slot) = sessions.entry(connect_id) else {
                return Err(RegistryError::AlreadyRegistered { connect_id });
            };
            Arc::clone(slot.insert(Arc::new(Mutex::new(session))))
        };

        self.bridge.persist(&mut *lock(&shared));
        info!(connect_id, "session registered");
        Ok(())
    }

    /// Tear down and forget the session for `connect_id`, discarding its
    /// saved snapshot. Returns false if there was none.
    pub fn remove(&self, connect_id: u32) -> bool {
        let Some(session) = lock(&self.sessions).remove(&connect_id) else {
            return false;
        };
        lock(&session).teardown();
        self.bridge.discard(connect_id);
        info!(connect_id, "session removed");
        true
    }

    fn ensure_vacant(&self, connect_id: u32) -> Result<(), RegistryError> {
        if lock(&self.sessions).contains_key(&connect_id) {
            return Err(RegistryError::AlreadyRegistered { connect_id });
        }
        Ok(())
    }

    fn get(&self, connect_id: u32) -> Result<SharedSession<E>, RegistryError> {
        lock(&self.sessions)
            .get(&connect_id)
            .cloned()
            .ok_or(RegistryError::UnknownSession { connect_id })
    }
}

impl<E: Environment, S: SnapshotStore> SessionLookup<E> for SessionRegistry<E, S> {
    fn with_session<R>(
        &self,
        connect_id: u32,
        operation: impl FnOnce(&mut ProtocolSession<E>) -> Result<R, SessionError>,
    ) -> Result<R, RegistryError> {
        let session = self.get(connect_id)?;
        let mut session = lock(&session);
        let result = operation(&mut *session);
        // Outcomes are logged and counted by the bridge
        self.bridge.persist(&mut *session);
        Ok(result?)
    }

    fn contains(&self, connect_id: u32) -> bool {
        lock(&self.sessions).contains_key(&connect_id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
