//! Range fences.
//!
//! Per-tile interval set ordering concurrent page-table updates to
//! overlapping address ranges: a PT-update job inserts its fence keyed by
//! `[start, last]`, and any later job touching the same range must depend
//! on every unsignaled fence already there. Entries remove themselves when
//! their fence signals.

use std::sync::{Arc, Mutex};

use crate::vm::fence::Fence;

struct RangeFence {
    id: u64,
    start: u64,
    last: u64,
    fence: Fence,
}

#[derive(Default)]
struct TreeInner {
    next_id: u64,
    entries: Vec<RangeFence>,
}

#[derive(Clone, Default)]
pub struct RangeFenceTree {
    inner: Arc<Mutex<TreeInner>>,
}

impl RangeFenceTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unsignaled fences overlapping `[start, last]`, in insertion order.
    #[must_use]
    pub fn overlapping(&self, start: u64, last: u64) -> Vec<Fence> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.start <= last && start <= e.last && !e.fence.is_signaled())
            .map(|e| e.fence.clone())
            .collect()
    }

    /// Track `fence` for `[start, last]`; the entry drops out once the
    /// fence signals.
    pub fn insert(&self, start: u64, last: u64, fence: Fence) {
        debug_assert!(start <= last);
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(RangeFence {
                id,
                start,
                last,
                fence: fence.clone(),
            });
            id
        };

        let tree = self.inner.clone();
        let remove = move |_: &Fence| {
            let mut inner = tree.lock().unwrap();
            inner.entries.retain(|e| e.id != id);
        };
        if fence.add_callback(remove.clone()).is_err() {
            remove(&fence);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_queries_respect_bounds() {
        let tree = RangeFenceTree::new();
        let fence = Fence::new();
        tree.insert(0x1000, 0x1fff, fence.clone());

        assert_eq!(tree.overlapping(0x0, 0xfff).len(), 0);
        assert_eq!(tree.overlapping(0x1800, 0x2fff).len(), 1);
        assert_eq!(tree.overlapping(0x2000, 0x2fff).len(), 0);
    }

    #[test]
    fn entries_drop_on_signal() {
        let tree = RangeFenceTree::new();
        let fence = Fence::new();
        tree.insert(0, 0xfff, fence.clone());
        assert!(!tree.is_empty());
        fence.signal();
        assert!(tree.is_empty());
    }

    #[test]
    fn signaled_fence_never_lingers() {
        let tree = RangeFenceTree::new();
        tree.insert(0, 0xfff, Fence::signaled_stub());
        assert!(tree.is_empty());
    }
}
