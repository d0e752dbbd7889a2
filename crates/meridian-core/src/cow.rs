//! Copy-on-write map primitive for routing state.
//!
//! All routing maps (channel bindings, dispatchers, conversation bindings,
//! agent-scope overrides) are held as immutable values behind an atomic
//! reference. A mutation clones the current map, applies the change, and
//! swaps the reference; a concurrent reader holding the old reference keeps
//! a stable snapshot. Writers serialize on the scheduler, so the CAS loop
//! in [`ArcSwap::rcu`] rarely retries.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A shared map whose contents are replaced wholesale on every mutation.
///
/// Reads are lock-free and see a consistent point-in-time view. Mutations
/// are O(n) in map size, which is fine at control-plane cardinalities
/// (nodes, channels, conversations).
#[derive(Debug)]
pub struct CowMap<K, V> {
    inner: ArcSwap<HashMap<K, V>>,
}

impl<K, V> CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Take a stable snapshot of the current contents.
    ///
    /// The snapshot is unaffected by later mutations.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<K, V>> {
        self.inner.load_full()
    }

    /// Look up a value, cloning it out of the current snapshot.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.load().get(key).cloned()
    }

    /// True if the key is present in the current snapshot.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.load().contains_key(key)
    }

    /// Number of entries in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    /// True if the current snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    /// Insert a key, returning the previously bound value if any.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let prev = self.inner.rcu(|map| {
            let mut next = HashMap::clone(map);
            next.insert(key.clone(), value.clone());
            next
        });
        prev.get(&key).cloned()
    }

    /// Remove a key, returning the value it was bound to if any.
    pub fn remove(&self, key: &K) -> Option<V> {
        let prev = self.inner.rcu(|map| {
            let mut next = HashMap::clone(map);
            next.remove(key);
            next
        });
        prev.get(key).cloned()
    }

    /// Keep only the entries the predicate accepts.
    ///
    /// Returns the number of entries removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let prev = self.inner.rcu(|map| {
            map.iter()
                .filter(|(k, v)| keep(k, v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<K, V>>()
        });
        let next_len = self.inner.load().len();
        prev.len().saturating_sub(next_len)
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.inner.store(Arc::new(HashMap::new()));
    }
}

impl<K, V> Default for CowMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let map = CowMap::new();
        assert_eq!(map.insert("a", 1), None);
        assert_eq!(map.insert("a", 2), Some(1));
        assert_eq!(map.get(&"a"), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_returns_previous() {
        let map = CowMap::new();
        map.insert("a", 1);
        assert_eq!(map.remove(&"a"), Some(1));
        assert_eq!(map.remove(&"a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn snapshot_is_stable_across_mutation() {
        let map = CowMap::new();
        map.insert("a", 1);
        let snap = map.snapshot();
        map.insert("b", 2);
        map.remove(&"a");

        // Old snapshot is untouched.
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get(&"a"), Some(&1));
        // Current view reflects both mutations.
        assert_eq!(map.get(&"a"), None);
        assert_eq!(map.get(&"b"), Some(2));
    }

    #[test]
    fn retain_filters_and_counts() {
        let map = CowMap::new();
        for i in 0..10 {
            map.insert(i, i);
        }
        let removed = map.retain(|_, v| v % 2 == 0);
        assert_eq!(removed, 5);
        assert_eq!(map.len(), 5);
        assert!(map.contains_key(&4));
        assert!(!map.contains_key(&5));
    }

    #[test]
    fn clear_empties() {
        let map = CowMap::new();
        map.insert("a", 1);
        map.clear();
        assert!(map.is_empty());
    }
}
