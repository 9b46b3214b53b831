//! Process-wide exclusive region for publish and unpublish.
//!
//! Holding the [`GateGuard`] for the full body of an operation makes the
//! "count references, then maybe delete the rootfs" sequence atomic with
//! respect to any concurrent publish, and leaves exactly one winner when two
//! publishes race to create the same rootfs.  The gate is not reentrant: an
//! operation must never try to enter it while already holding it.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

/// A single async mutex that serializes every volume operation.
#[derive(Debug, Default)]
pub struct PublishGate {
    lock: Mutex<()>,
    entries: AtomicU64,
}

/// Proof that the holder is the only operation running.  Released on drop.
#[derive(Debug)]
pub struct GateGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl PublishGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other operation is running, then enter.
    pub async fn enter(&self) -> GateGuard<'_> {
        let guard = self.lock.lock().await;
        let n = self.entries.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(entry = n, "entered publish gate");
        GateGuard { _guard: guard }
    }

    /// Enter only if the gate is free.
    #[cfg(test)]
    pub fn try_enter(&self) -> Option<GateGuard<'_>> {
        let guard = self.lock.try_lock().ok()?;
        self.entries.fetch_add(1, Ordering::Relaxed);
        Some(GateGuard { _guard: guard })
    }

    /// Total number of times the gate has been entered.
    #[cfg(test)]
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_is_exclusive_and_not_reentrant() {
        let gate = PublishGate::new();
        let guard = gate.enter().await;
        assert!(gate.try_enter().is_none());
        drop(guard);
        assert!(gate.try_enter().is_some());
        assert_eq!(gate.entries(), 2);
    }

    #[tokio::test]
    async fn concurrent_holders_never_overlap() {
        let gate = Arc::new(PublishGate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let _g = gate.enter().await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(gate.entries(), 8);
    }
}
