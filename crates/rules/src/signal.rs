//! One-shot broadcast signals for lifecycle coordination.
//!
//! [`Signal`] is the primitive behind the manager's `block`/`done` gates and
//! each group's stop/terminated pair: any number of waiters, a single
//! irreversible fire, cheap clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A one-shot broadcast gate.
///
/// Waiters registered before [`fire`](Signal::fire) are woken; waiters
/// arriving afterwards return immediately.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, releasing all current and future waiters. Idempotent.
    pub fn fire(&self) {
        if !self.inner.fired.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        if self.is_fired() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before re-checking to close the fire window.
        notified.as_mut().enable();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}
