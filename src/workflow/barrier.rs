//! Async barrier with per-waiter cancellation
//!
//! The barrier releases exactly once: either when the expected number of
//! signals has arrived or when it is released explicitly. Waiters observe the
//! release through a watch channel, so a waiter that gives up only drops its
//! own receiver and never touches the shared count or release flag.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::error::WorkflowError;

#[derive(Debug)]
pub struct AsyncBarrier {
    expected: usize,
    signals:  AtomicUsize,
    released: watch::Sender<bool>
}

impl AsyncBarrier {
    /// A barrier expecting `expected` signals; zero means already released
    pub fn new(expected: usize) -> Self {
        let (released, _) = watch::channel(expected == 0);
        Self { expected, signals: AtomicUsize::new(0), released }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn signal_count(&self) -> usize {
        self.signals.load(Ordering::Acquire)
    }

    /// Record one signal; returns true only for the signal that released the barrier
    pub fn signal(&self) -> bool {
        let count = self.signals.fetch_add(1, Ordering::AcqRel) + 1;
        count == self.expected && self.release()
    }

    /// Release every current and future waiter; returns false if already released
    pub fn release(&self) -> bool {
        !self.released.send_replace(true)
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Wait for release, or until this waiter's own token is cancelled
    pub async fn join(&self, cancellation: &CancellationToken) -> Result<(), WorkflowError> {
        let mut receiver = self.released.subscribe();
        tokio::select! {
            biased;
            result = receiver.wait_for(|released| *released) => {
                result.map(|_| ()).map_err(|_| WorkflowError::Cancelled("barrier dropped before release".to_string()))
            }
            _ = cancellation.cancelled() => Err(WorkflowError::Cancelled("barrier wait cancelled".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn test_releases_once_all_signals_arrive() {
        let barrier = AsyncBarrier::new(3);
        assert!(!barrier.signal());
        assert!(!barrier.signal());
        assert!(!barrier.is_released());
        assert!(barrier.signal());
        assert!(barrier.is_released());

        // Extra signals never release a second time
        assert!(!barrier.signal());
        barrier.join(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_unblocks_all_waiters() {
        let barrier = Arc::new(AsyncBarrier::new(1));
        let mut waiters = Vec::new();
        for _ in 0..5 {
            let barrier = barrier.clone();
            waiters.push(tokio::spawn(async move { barrier.join(&CancellationToken::new()).await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(barrier.release());

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelling_one_waiter_does_not_affect_others() {
        let barrier = Arc::new(AsyncBarrier::new(2));
        let cancelled_token = CancellationToken::new();

        let cancelled = {
            let barrier = barrier.clone();
            let token = cancelled_token.clone();
            tokio::spawn(async move { barrier.join(&token).await })
        };
        let survivors = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                tokio::spawn(async move { barrier.join(&CancellationToken::new()).await })
            })
            .collect::<Vec<_>>();

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancelled_token.cancel();
        let result = cancelled.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());

        // Shared state untouched by the cancellation
        assert!(!barrier.is_released());
        assert_eq!(barrier.signal_count(), 0);

        barrier.signal();
        assert!(barrier.signal());
        for survivor in survivors {
            survivor.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_expected_is_released() {
        let barrier = AsyncBarrier::new(0);
        assert!(barrier.is_released());
        barrier.join(&CancellationToken::new()).await.unwrap();
    }
}
