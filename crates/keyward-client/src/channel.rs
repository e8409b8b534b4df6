//! Encrypted request/response over a transport.
//!
//! A [`SecureChannel`] seals each request with the connection's session,
//! sends it through the retry engine and opens the response. Sealing happens
//! once per request, so retries resend the same envelope and the peer's
//! replay protection drops duplicates that did arrive.

use std::sync::Arc;

use keyward_core::{EncryptedEnvelope, Environment, FailureCategory, OperationKind};
use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    cancellation::Cancellation,
    registry::{RegistryError, SessionLookup},
    resilience::{ResilienceEngine, ResilienceError},
    transport::Transport,
};

/// Secure channel errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Sealing or opening failed
    #[error(transparent)]
    Session(#[from] RegistryError),

    /// The call did not complete
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

/// Request/response channel for one connection.
pub struct SecureChannel<E: Environment, L, T> {
    connect_id: u32,
    sessions: Arc<L>,
    transport: T,
    engine: Arc<ResilienceEngine<E>>,
}

impl<E, L, T> SecureChannel<E, L, T>
where
    E: Environment,
    L: SessionLookup<E>,
    T: Transport,
{
    /// Channel for `connect_id`. The session must already be registered in
    /// `sessions`.
    pub fn new(
        connect_id: u32,
        sessions: Arc<L>,
        transport: T,
        engine: Arc<ResilienceEngine<E>>,
    ) -> Self {
        Self { connect_id, sessions, transport, engine }
    }

    /// Connection served by this channel.
    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// Seal `plaintext`, send it and open the response.
    ///
    /// A response that does not open is reported to the health manager as a
    /// cryptographic desync.
    pub async fn request(
        &self,
        plaintext: &[u8],
        cancel: &Cancellation,
    ) -> Result<Vec<u8>, ChannelError> {
        let connect_id = self.connect_id;
        let request = self
            .sessions
            .with_session(connect_id, |session| session.encrypt(plaintext)?.to_bytes())?;
        trace!(connect_id, bytes = request.len(), "request sealed");

        let response = self
            .engine
            .execute(connect_id, OperationKind::Request, cancel, || {
                self.transport.call(connect_id, request.clone())
            })
            .await?;

        let opened = self.sessions.with_session(connect_id, |session| {
            let envelope = EncryptedEnvelope::from_bytes(&response)?;
            session.decrypt(&envelope)
        });
        match opened {
            Ok(plaintext) => Ok(plaintext),
            Err(error) => {
                warn!(connect_id, %error, "response did not open");
                self.engine.health().record_failure(
                    connect_id,
                    OperationKind::Receive,
                    FailureCategory::CryptographicDesync,
                    self.engine.env().now(),
                );
                Err(error.into())
            },
        }
    }
}
