use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::MeshError;

pub type DelayCallback = Arc<dyn Fn() + Send + Sync>;

/// A one-shot timer with loud or silent cancellation.
///
/// `on_timeout` fires exactly once if the delay elapses uncancelled;
/// `on_cancellation` fires exactly once on a loud cancel before expiry. A
/// cancel issued while the caller holds a lock the callbacks might re-enter
/// must be silent.
pub struct CancellableDelay {
    delay: Duration,
    on_timeout: DelayCallback,
    on_cancellation: DelayCallback,
    started: AtomicBool,
    expired: AtomicBool,
    cancelled: AtomicBool,
    cancel_tx: Mutex<Option<oneshot::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CancellableDelay {
    pub fn new(
        delay: Duration,
        on_timeout: DelayCallback,
        on_cancellation: DelayCallback,
    ) -> Arc<Self> {
        Arc::new(CancellableDelay {
            delay,
            on_timeout,
            on_cancellation,
            started: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_tx: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Arm the timer. Fails on the second and later calls.
    pub fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MeshError::Internal("delay already started".into()));
        }
        let (cancel_tx, cancel_rx) = oneshot::channel::<bool>();
        *self.cancel_tx.lock() = Some(cancel_tx);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(this.delay) => {
                    // The cancel flag may have been raised between the timer
                    // firing and this branch running; cancellation wins.
                    if !this.cancelled.load(Ordering::SeqCst) {
                        this.expired.store(true, Ordering::SeqCst);
                        (this.on_timeout)();
                    }
                }
                silent = cancel_rx => {
                    if let Ok(false) = silent {
                        (this.on_cancellation)();
                    }
                }
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Cancel the timer. No-op after expiry or a previous cancel. `silent`
    /// suppresses the cancellation callback.
    pub fn cancel(&self, silent: bool) {
        if !self.started.load(Ordering::SeqCst) || self.expired.load(Ordering::SeqCst) {
            return;
        }
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.cancel_tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(silent);
            }
            None => warn!("delay cancelled before start"),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for CancellableDelay {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (DelayCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&count);
        (
            Arc::new(move || {
                cloned.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fires_timeout_exactly_once() {
        let (on_timeout, timeouts) = counter();
        let (on_cancel, cancels) = counter();
        let delay = CancellableDelay::new(Duration::from_millis(100), on_timeout, on_cancel);
        delay.start().unwrap();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert!(delay.is_expired());
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);

        // Cancelling after expiry is a no-op.
        delay.cancel(false);
        assert!(!delay.is_cancelled());
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loud_cancel_fires_cancellation_and_suppresses_timeout() {
        let (on_timeout, timeouts) = counter();
        let (on_cancel, cancels) = counter();
        let delay = CancellableDelay::new(Duration::from_millis(100), on_timeout, on_cancel);
        delay.start().unwrap();
        delay.cancel(false);
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(delay.is_cancelled());
        assert!(!delay.is_expired());
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        // Second cancel does not re-notify.
        delay.cancel(false);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_cancel_notifies_nobody() {
        let (on_timeout, timeouts) = counter();
        let (on_cancel, cancels) = counter();
        let delay = CancellableDelay::new(Duration::from_millis(100), on_timeout, on_cancel);
        delay.start().unwrap();
        delay.cancel(true);
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_fail() {
        let (on_timeout, _) = counter();
        let (on_cancel, _) = counter();
        let delay = CancellableDelay::new(Duration::from_secs(10), on_timeout, on_cancel);
        delay.start().unwrap();
        assert!(delay.start().is_err());
        delay.cancel(true);
    }
}
