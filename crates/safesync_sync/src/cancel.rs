//! Cooperative cancellation of sync work.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A cloneable cancellation signal.
///
/// All clones observe the same flag. Cancelling is idempotent and cannot be
/// undone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Creates a signal that is not cancelled.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds a sender.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a remote call bounded by `timeout` and raced against `cancel`.
pub(crate) async fn guarded<T, F>(
    cancel: &CancelSignal,
    timeout: Duration,
    what: &str,
    call: F,
) -> SyncResult<T>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(inner) => inner.map_err(SyncError::from),
            Err(_) => Err(SyncError::network_retryable(format!("{what} timed out after {timeout:?}"))),
        },
    }
}

/// Sleeps for `delay` unless cancelled first.
pub(crate) async fn pause(cancel: &CancelSignal, delay: Duration) -> SyncResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_idempotent_and_shared() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_cancelled());

        signal.cancel();
        signal.cancel();

        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn guarded_call_is_cancelled() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();

        let task = tokio::spawn(async move {
            guarded(&waiter, Duration::from_secs(60), "download", async {
                std::future::pending::<Result<(), RemoteError>>().await
            })
            .await
        });
        signal.cancel();

        assert!(matches!(task.await.unwrap(), Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn guarded_call_times_out() {
        let signal = CancelSignal::new();
        let result = guarded(&signal, Duration::from_millis(10), "upload", async {
            std::future::pending::<Result<(), RemoteError>>().await
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("upload timed out"));
    }

    #[tokio::test]
    async fn guarded_call_passes_result_through() {
        let signal = CancelSignal::new();
        let value = guarded(&signal, Duration::from_secs(1), "check", async {
            Ok::<_, RemoteError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}
