//! Explicit cancellation for guarded operations, backoff sleeps and grace periods.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation handle. Every clone observes the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    signal: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
        }
    }

    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.signal.subscribe();
        // The sender lives as long as `self`, so the channel cannot close while we wait.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration`, returning `false` if cancelled first.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn clones_share_the_signal() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_stops_early_when_cancelled() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(60)).await });

        tokio::task::yield_now().await;
        token.cancel();
        assert!(!handle.await.expect("sleep task"));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancellation() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(150)).await);
    }
}
