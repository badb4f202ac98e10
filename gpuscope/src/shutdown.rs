//! Cooperative shutdown signal shared by the drain task and the consumer
//! loop. Asynchronous notification (Ctrl-C, duration limit) sets a flag; the
//! poll loop observes it between waits, never mid-record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination. Idempotent; wakes every pending wait.
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the shutdown has been requested.
    pub async fn triggered(&self) {
        while !self.is_triggered() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Arm before re-checking the flag so a trigger between the check
            // and the await is not lost.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_is_idempotent_and_observable() {
        let s = Shutdown::new();
        assert!(!s.is_triggered());
        s.trigger();
        s.trigger();
        assert!(s.is_triggered());
        // Resolves immediately once tripped.
        s.triggered().await;
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_woken_by_a_later_trigger() {
        let s = Shutdown::new();
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.triggered().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        s.trigger();
        waiter.await.unwrap();
    }
}
