//! Lock-free multiset used for outcome counters.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Counts occurrences per key without holding a lock across increments.
///
/// Many workers increment concurrently; each count is an atomic add, so
/// [`total`](Self::total) observes every completed increment but is only a
/// lower bound while puts are in flight. [`snapshot`](Self::snapshot) is
/// not a consistent cut across keys; each individual count is a value the
/// counter really held.
#[derive(Debug)]
pub struct ConcurrentHistogram<K: Eq + Hash> {
    counts: DashMap<K, AtomicU64>,
    total: AtomicU64,
}

impl<K: Eq + Hash + 'static> Default for ConcurrentHistogram<K> {
    fn default() -> Self {
        Self {
            counts: DashMap::new(),
            total: AtomicU64::new(0),
        }
    }
}

impl<K: Eq + Hash + Clone + 'static> ConcurrentHistogram<K> {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
            total: AtomicU64::new(0),
        }
    }

    /// Increment the count for `key` by one.
    pub fn put(&self, key: K) {
        self.put_n(key, 1);
    }

    /// Increment the count for `key` by `n`.
    pub fn put_n(&self, key: K, n: u64) {
        if n == 0 {
            return;
        }
        // Fast path: the key already exists and the add is a plain atomic.
        if let Some(counter) = self.counts.get(&key) {
            counter.fetch_add(n, Ordering::Relaxed);
        } else {
            self.counts
                .entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(n, Ordering::Relaxed);
        }
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Count for `key`, zero when absent.
    pub fn get(&self, key: &K) -> u64 {
        self.counts
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<K> {
        self.counts.iter().map(|e| e.key().clone()).collect()
    }

    /// Sum of all counts observed so far.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Fold every count of `other` into this histogram.
    pub fn merge(&self, other: &Self) {
        for entry in other.counts.iter() {
            let count = entry.value().load(Ordering::Relaxed);
            if count > 0 {
                self.put_n(entry.key().clone(), count);
            }
        }
    }

    pub fn clear(&self) {
        self.counts.clear();
        self.total.store(0, Ordering::Relaxed);
    }
}

impl<K: Eq + Hash + Clone + Ord + 'static> ConcurrentHistogram<K> {
    /// Copy of the key/count pairs, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<K, u64> {
        self.counts
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counts_and_total() {
        let h = ConcurrentHistogram::new();
        h.put("a");
        h.put("a");
        h.put_n("b", 3);
        assert_eq!(h.get(&"a"), 2);
        assert_eq!(h.get(&"b"), 3);
        assert_eq!(h.get(&"c"), 0);
        assert_eq!(h.total(), 5);
    }

    #[test]
    fn zero_increment_is_a_no_op() {
        let h = ConcurrentHistogram::new();
        h.put_n("a", 0);
        assert!(h.is_empty());
        assert_eq!(h.total(), 0);
    }

    #[test]
    fn merge_adds_counts_pointwise() {
        let a = ConcurrentHistogram::new();
        let b = ConcurrentHistogram::new();
        a.put_n(1usize, 2);
        a.put_n(2usize, 1);
        b.put_n(2usize, 4);
        b.put_n(3usize, 7);

        a.merge(&b);
        assert_eq!(a.get(&1), 2);
        assert_eq!(a.get(&2), 5);
        assert_eq!(a.get(&3), 7);
        assert_eq!(a.total(), 14);
    }

    #[test]
    fn merging_an_empty_histogram_changes_nothing() {
        let a = ConcurrentHistogram::new();
        a.put_n("x", 9);
        a.merge(&ConcurrentHistogram::new());
        assert_eq!(a.get(&"x"), 9);
        assert_eq!(a.total(), 9);
    }

    #[test]
    fn snapshot_is_sorted_by_key() {
        let h = ConcurrentHistogram::new();
        h.put_n(3usize, 1);
        h.put_n(1usize, 2);
        h.put_n(2usize, 3);
        let snap = h.snapshot();
        let keys: Vec<usize> = snap.keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(snap[&1], 2);
    }

    #[test]
    fn concurrent_puts_lose_nothing() {
        let h = Arc::new(ConcurrentHistogram::new());
        let threads = 8;
        let per_thread = 10_000u64;
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let h = Arc::clone(&h);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        h.put((t + i as usize) % 4);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("counter thread panicked");
        }
        assert_eq!(h.total(), threads as u64 * per_thread);
        let sum: u64 = h.snapshot().values().sum();
        assert_eq!(sum, h.total());
    }
}
