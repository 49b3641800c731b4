//! Hot-reloadable sets (§9 "Whitelist hot-swap", §10.4): the IP whitelist,
//! command gray-list, and broadcast command whitelist are each published as
//! an immutable snapshot behind `arc_swap::ArcSwap`. A background poller (in
//! the `shardproxy` binary) re-reads its backing file on an interval and
//! swaps in a new `Arc<HashSet<_>>`; the data plane only ever calls `load`,
//! never a lock — read-copy-update semantics replace the source's two-buffer
//! atomic-tag swap, per the design note.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;

pub struct HotSet<T> {
    inner: ArcSwap<HashSet<T>>,
}

impl<T: Eq + Hash> HotSet<T> {
    pub fn new(initial: HashSet<T>) -> Self {
        HotSet {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashSet::new())
    }

    /// The data-plane read path: a single atomic load, no lock.
    pub fn load(&self) -> Arc<HashSet<T>> {
        self.inner.load_full()
    }

    pub fn contains<Q>(&self, value: &Q) -> bool
    where
        T: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.load().contains(value)
    }

    /// Publishes a freshly re-read snapshot. Called only by the poller
    /// thread.
    pub fn publish(&self, new_set: HashSet<T>) {
        self.inner.store(Arc::new(new_set));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_see_snapshot_after_publish() {
        let set: HotSet<String> = HotSet::empty();
        assert!(!set.contains("KEYS"));
        let mut next = HashSet::new();
        next.insert("KEYS".to_string());
        set.publish(next);
        assert!(set.contains("KEYS"));
    }
}
