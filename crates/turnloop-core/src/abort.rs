//! Cooperative cancellation shared between a session, its in-flight model
//! call, and every tool execution it spawns.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// A shared cancellation token. `abort()` happens-before any subsequent
/// `is_aborted()` observing `true` on any clone or child of this signal.
///
/// Composable: `child()` produces a signal that is already aborted if its
/// parent is aborted at the time of creation, and becomes aborted whenever
/// the parent does thereafter.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<Mutex<CancellationToken>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn abort(&self) {
        self.inner.lock().unwrap().cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().is_cancelled()
    }

    /// Resets the signal to a fresh, un-aborted state. Intended for test
    /// reuse only; production code should construct a new `AbortSignal`
    /// instead of clearing a live one.
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = CancellationToken::new();
    }

    /// A child signal that inherits the parent's aborted state at creation
    /// time and tracks any later abort of the parent.
    pub fn child(&self) -> Self {
        let child_token = self.inner.lock().unwrap().child_token();
        Self {
            inner: Arc::new(Mutex::new(child_token)),
        }
    }

    /// Resolves once this signal is aborted.
    pub async fn cancelled(&self) {
        let token = self.inner.lock().unwrap().clone();
        token.cancelled().await;
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_signal_is_not_aborted() {
        let sig = AbortSignal::new();
        assert!(!sig.is_aborted());
    }

    #[test]
    fn abort_is_observable() {
        let sig = AbortSignal::new();
        sig.abort();
        assert!(sig.is_aborted());
    }

    #[test]
    fn child_inherits_already_aborted_parent() {
        let parent = AbortSignal::new();
        parent.abort();
        let child = parent.child();
        assert!(child.is_aborted());
    }

    #[test]
    fn child_observes_later_parent_abort() {
        let parent = AbortSignal::new();
        let child = parent.child();
        assert!(!child.is_aborted());
        parent.abort();
        assert!(child.is_aborted());
    }

    #[test]
    fn clear_resets_for_reuse() {
        let sig = AbortSignal::new();
        sig.abort();
        assert!(sig.is_aborted());
        sig.clear();
        assert!(!sig.is_aborted());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_abort() {
        let sig = AbortSignal::new();
        let waiter = sig.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        sig.abort();
        handle.await.unwrap();
    }
}
