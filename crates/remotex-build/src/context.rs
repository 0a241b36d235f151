//! Deadline plus cancellation signal carried through a build.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    DeadlineExceeded,
    Cancelled,
}

impl CancelReason {
    pub fn describe(&self) -> &'static str {
        match self {
            CancelReason::DeadlineExceeded => "build exceeded its maximum duration",
            CancelReason::Cancelled => "build cancelled",
        }
    }
}

/// Cancels every context derived from the one it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// A cancellable scope with an optional deadline.
///
/// Derived contexts share the cancellation signal and can only tighten the
/// deadline.
#[derive(Debug, Clone)]
pub struct BuildContext {
    deadline: Option<Instant>,
    cancel_rx: watch::Receiver<bool>,
    // keeps the signal open for contexts created without a handle
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl BuildContext {
    /// A root context and the handle that cancels it.
    pub fn new() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (
            Self {
                deadline: None,
                cancel_rx: rx,
                _keepalive: Some(tx.clone()),
            },
            CancelHandle { tx },
        )
    }

    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::new().0
    }

    /// Derive a context that also ends after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel_rx: self.cancel_rx.clone(),
            _keepalive: self._keepalive.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context has already ended.
    pub fn is_done(&self) -> bool {
        *self.cancel_rx.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolve once the deadline passes or cancellation is signalled.
    pub async fn done(&self) -> CancelReason {
        let mut rx = self.cancel_rx.clone();
        let cancelled = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // every sender is gone; cancellation can no longer happen
                    std::future::pending::<()>().await;
                }
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                _ = cancelled => CancelReason::Cancelled,
            },
            None => {
                cancelled.await;
                CancelReason::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_fires() {
        let ctx = BuildContext::background().with_timeout(Duration::from_secs(3));
        assert!(!ctx.is_done());
        assert_eq!(ctx.done().await, CancelReason::DeadlineExceeded);
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_deadline_never_extends_parent() {
        let parent = BuildContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
        let tighter = parent.with_timeout(Duration::from_millis(10));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[tokio::test]
    async fn cancel_reaches_derived_contexts() {
        let (root, handle) = BuildContext::new();
        let child = root.with_timeout(Duration::from_secs(3600));
        let waiter = tokio::spawn(async move { child.done().await });
        handle.cancel();
        assert_eq!(waiter.await.unwrap(), CancelReason::Cancelled);
        assert!(root.is_done());
    }
}
