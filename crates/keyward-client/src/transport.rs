//! Transport collaborator contract.
//!
//! The surrounding RPC stack is abstracted as a single request/response call
//! per connection. Every call made through the client goes through the retry
//! engine, so implementations should report failures with an accurate
//! [`TransportErrorKind`] rather than retrying internally.

use std::sync::Arc;

use async_trait::async_trait;
use keyward_core::FailureCategory;
use thiserror::Error;

/// Coarse outcome class reported by the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Endpoint unreachable or connection dropped
    Unavailable,
    /// Call did not finish in time
    DeadlineExceeded,
    /// Endpoint is throttling the client
    ResourceExhausted,
    /// Credentials rejected
    Unauthenticated,
    /// Request rejected as malformed
    InvalidArgument,
    /// Endpoint failed while handling the request
    Internal,
}

impl TransportErrorKind {
    /// Returns true if the call is worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Unavailable | Self::DeadlineExceeded | Self::ResourceExhausted)
    }

    /// Health category used when the transport does not supply one.
    pub fn default_category(self) -> FailureCategory {
        match self {
            Self::Unavailable => FailureCategory::Connectivity,
            Self::DeadlineExceeded => FailureCategory::Timeout,
            Self::ResourceExhausted => FailureCategory::RateLimit,
            Self::Unauthenticated => FailureCategory::Authentication,
            Self::InvalidArgument => FailureCategory::Protocol,
            Self::Internal => FailureCategory::ServerError,
        }
    }
}

/// Failed transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} ({category}): {message}")]
pub struct TransportError {
    /// Outcome class, decides retry
    pub kind: TransportErrorKind,
    /// Health category, decides status escalation
    pub category: FailureCategory,
    /// Human-readable detail
    pub message: String,
}

impl TransportError {
    /// Error with the kind's default category.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, category: kind.default_category(), message: message.into() }
    }

    /// Error whose category is sniffed from `message`, for collaborators that
    /// only report text.
    pub fn classified(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let category = match FailureCategory::classify(&message) {
            FailureCategory::Unknown => kind.default_category(),
            category => category,
        };
        Self { kind, category, message }
    }

    /// Replace the category.
    #[must_use]
    pub fn with_category(mut self, category: FailureCategory) -> Self {
        self.category = category;
        self
    }

    /// Returns true if the call is worth retrying.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Request/response transport for one logical endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` on `connect_id` and wait for the response payload.
    async fn call(&self, connect_id: u32, request: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn call(&self, connect_id: u32, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        (**self).call(connect_id, request).await
    }
}

type Handler = dyn Fn(u32, Vec<u8>) -> Result<Vec<u8>, TransportError> + Send + Sync;

/// In-process transport answering every call with a handler.
///
/// Used to wire a client to a peer session in the same process.
#[derive(Clone)]
pub struct LoopbackTransport {
    handler: Arc<Handler>,
}

impl LoopbackTransport {
    /// Transport that answers with `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(u32, Vec<u8>) -> Result<Vec<u8>, TransportError> + Send + Sync + 'static,
    {
        Self { handler: Arc::new(handler) }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn call(&self, connect_id: u32, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        (self.handler)(connect_id, request)
    }
}
