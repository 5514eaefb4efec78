//! Cooperative cancellation for background tasks.
//!
//! Every long-lived task (SYN retry loop, keepalive, relay read loop, probe
//! event loop) receives a [`Shutdown`] from its owner. Cancelling a token
//! also cancels every child derived from it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    parent: Option<Shutdown>,
}

/// Hierarchical cancellation token
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a root token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token cancelled with `self` but cancellable on its own
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this token and its children
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether this token or any ancestor is cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.inner.parent.as_ref().is_some_and(Shutdown::is_cancelled)
    }

    /// Resolve once this token or any ancestor is cancelled
    pub async fn cancelled(&self) {
        self.wait().await;
    }

    fn wait(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            loop {
                // Registered before the flag check so a concurrent cancel
                // cannot slip between the two.
                let notified = self.inner.notify.notified();
                if self.is_cancelled() {
                    return;
                }
                match &self.inner.parent {
                    Some(parent) => {
                        tokio::select! {
                            _ = notified => {}
                            _ = parent.wait() => return,
                        }
                    }
                    None => notified.await,
                }
            }
        })
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = Shutdown::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancels_child() {
        let parent = Shutdown::new();
        let child = parent.child();
        let grandchild = child.child();

        let waiter = {
            let grandchild = grandchild.clone();
            tokio::spawn(async move { grandchild.cancelled().await })
        };

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("grandchild should observe parent cancel")
            .unwrap();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = Shutdown::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let token = Shutdown::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
