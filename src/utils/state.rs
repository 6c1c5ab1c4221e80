use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free snapshot cell with a change counter.
///
/// Writers either publish a whole new snapshot or mutate interior-mutable
/// fields of the current one; both bump the sequence so observers can poll
/// `changed_since` without taking a lock. Readers never block writers.
#[derive(Debug)]
pub struct StateCell<S> {
    snap: ArcSwap<S>,
    seq: CachePadded<AtomicU64>,
}

impl<S: Send + Sync + 'static> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            snap: ArcSwap::from(Arc::new(initial)),
            seq: CachePadded::new(AtomicU64::new(1)),
        }
    }

    pub fn new_arc(initial: S) -> Arc<Self> {
        Arc::new(Self::new(initial))
    }

    /// Replace the snapshot wholesale.
    #[inline]
    pub fn publish(&self, next: S) {
        self.snap.store(Arc::new(next));
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Owned handle to the current snapshot.
    #[inline]
    pub fn load(&self) -> Arc<S> {
        self.snap.load_full()
    }

    /// Short-lived borrow of the current snapshot; prefer for single reads
    /// on the hot path, keep the guard local.
    #[inline]
    pub fn peek(&self) -> arc_swap::Guard<Arc<S>> {
        self.snap.load()
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    #[inline]
    pub fn changed_since(&self, last: u64) -> bool {
        self.seq() != last
    }

    /// Mutate interior-mutable fields of the current snapshot (atomics,
    /// locks) without replacing it. Still bumps the sequence.
    #[inline]
    pub fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&S),
    {
        let guard = self.snap.load();
        f(&guard);
        self.seq.fetch_add(1, Ordering::Release);
    }
}
