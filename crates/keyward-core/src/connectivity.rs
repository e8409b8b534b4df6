//! Connectivity events for presentation and monitoring.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::health::ConnectionStatus;

/// Default capacity of the connectivity event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Connection-level event published on the broadcast stream.
///
/// Slow subscribers lose the oldest events (`RecvError::Lagged`) rather than
/// stalling publishers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Effective status of a connection changed
    StatusChanged {
        /// Connection whose status changed
        connect_id: u32,
        /// Status before the change
        previous: ConnectionStatus,
        /// Status after the change
        current: ConnectionStatus,
    },

    /// Circuit breaker opened; no attempts until the cool-down elapses
    CircuitOpen {
        /// Connection guarded by the breaker
        connect_id: u32,
        /// Cool-down before a trial attempt
        retry_after: Duration,
    },

    /// Circuit breaker closed after a successful attempt
    CircuitClosed {
        /// Connection guarded by the breaker
        connect_id: u32,
    },
}

/// Publishing half of the connectivity stream.
///
/// Cheap to clone; every clone publishes to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<ConnectivityEvent>,
}

impl EventPublisher {
    /// Channel retaining up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ConnectivityEvent) {
        let _ = self.sender.send(event);
    }

    /// New subscriber receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
