//! Cooperative cancellation for retried operations.

use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation signal shared between a caller and the operations it started.
///
/// Clones observe the same signal. Cancelling is sticky: once set it cannot
/// be cleared. In-flight transport calls are not interrupted; the signal is
/// observed before each attempt and while waiting.
#[derive(Debug, Clone)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Cancellation {
    /// Fresh, uncancelled signal.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender: Arc::new(sender), receiver }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns true once [`Cancellation::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender lives as long as any clone, so this is unreachable while
            // `self` is borrowed.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        assert!(!Cancellation::new().is_cancelled());
    }

    #[test]
    fn clones_share_signal() {
        let token = Cancellation::new();
        let clone = token.clone();

        clone.cancel();

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = Cancellation::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();

        waiter.await.expect("waiter should complete");
    }

    #[tokio::test]
    async fn cancelled_is_immediate_after_cancel() {
        let token = Cancellation::new();
        token.cancel();

        token.cancelled().await;
    }
}
