use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Versioned snapshot cell.
///
/// Producers publish whole snapshots; consumers poll cheaply for a
/// changed sequence number and only then load the new `Arc`. Used to
/// hand declarative pipeline targets to the reconciler without the
/// producer ever blocking on reconciliation.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    snap: ArcSwap<T>,
    seq: CachePadded<AtomicU64>,
}

impl<T> SnapshotCell<T> {
    pub fn new(init: T) -> Self {
        Self {
            snap: ArcSwap::from(Arc::new(init)),
            seq: CachePadded::new(AtomicU64::new(1)),
        }
    }

    pub fn new_arc(init: T) -> Arc<Self> {
        Arc::new(Self::new(init))
    }

    /// Replace the snapshot and bump the sequence.
    pub fn publish(&self, next: T) {
        self.snap.store(Arc::new(next));
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Current snapshot as an owned `Arc`.
    #[inline]
    pub fn load(&self) -> Arc<T> {
        self.snap.load_full()
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    #[inline]
    pub fn changed_since(&self, last: u64) -> bool {
        self.seq() != last
    }

    /// Load the snapshot only if the sequence moved past `last_seq`,
    /// updating `last_seq` on a hit.
    pub fn load_if_changed(&self, last_seq: &mut u64) -> Option<Arc<T>> {
        let cur = self.seq.load(Ordering::Acquire);
        if cur == *last_seq {
            return None;
        }
        *last_seq = cur;
        Some(self.snap.load_full())
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
