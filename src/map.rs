//! Provides the concurrent map on which both cache engines operate.
//!
//! The caches never take locks themselves. All shared state lives in a [ConcurrentMap], and every
//! mutation goes through one of its atomic primitives. The default implementation is the
//! [ShardedMap], but any map which fulfills the contracts below can be plugged in via
//! `PointCache::with_map` or `BulkCache::with_map`.
//!
//! Values are expected to be cheap handles (e.g. **Arc**s) as they are cloned out of the map on
//! every access.
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fnv::FnvBuildHasher;

/// Describes a thread-safe map which supports an atomic "get or insert".
pub trait ConcurrentMap<K, V>: Send + Sync {
    /// Returns a copy of the value stored for the given key.
    fn get(&self, key: &K) -> Option<V>;

    /// Returns the value stored for the given key or atomically inserts the one created by
    /// **factory**.
    ///
    /// The returned flag is **true** if the value already existed. For any number of concurrent
    /// calls for an absent key, exactly one observes **false** and only this call runs its
    /// factory.
    fn get_or_insert_with<F>(&self, key: K, factory: F) -> (V, bool)
    where
        F: FnOnce() -> V;

    /// Unconditionally stores the given value.
    fn set(&self, key: K, value: V);

    /// Removes all given keys. Unknown keys are ignored.
    fn remove_all(&self, keys: &[K]);

    /// Removes each of the given keys whose current value matches **predicate**.
    ///
    /// Checking and removing happens atomically per key. A value which has been replaced since
    /// the caller looked at it is therefore judged on its own. Returns the number of removed
    /// entries.
    fn remove_if<F>(&self, keys: &[K], predicate: F) -> usize
    where
        F: Fn(&V) -> bool;

    /// Returns a copy of all entries.
    ///
    /// This may be called while other tasks modify the map. The result reflects some state of
    /// each entry during the call, not necessarily one consistent state of the whole map.
    fn snapshot(&self) -> Vec<(K, V)>;

    /// Removes all entries.
    fn clear(&self);

    /// Returns the number of entries.
    fn len(&self) -> usize;

    /// Determines if the map is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Shard<K, V> = RwLock<HashMap<K, V, FnvBuildHasher>>;

/// A concurrent map which splits its keys onto several independently locked hash maps.
///
/// Each lock is only held for a single map operation and never while user code (like a producer)
/// runs, so contention stays low even with many readers.
///
/// # Examples
/// ```
/// # use evergreen::map::{ConcurrentMap, ShardedMap};
/// let map = ShardedMap::new();
///
/// let (value, existed) = map.get_or_insert_with("a", || 1);
/// assert_eq!((value, existed), (1, false));
///
/// // The factory of a second call isn't invoked as the key is already present...
/// let (value, existed) = map.get_or_insert_with("a", || 2);
/// assert_eq!((value, existed), (1, true));
///
/// map.set("b", 3);
/// map.remove_all(&["a"]);
/// assert_eq!(map.snapshot(), vec![("b", 3)]);
/// ```
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    hasher: FnvBuildHasher,
}

impl<K, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        ShardedMap::with_shards(num_cpus::get() * 4)
    }
}

impl<K, V> ShardedMap<K, V> {
    /// Creates a new map with a number of shards suitable for this machine.
    pub fn new() -> Self {
        ShardedMap::default()
    }

    /// Creates a new map with the given number of shards (rounded up to the next power of two).
    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        ShardedMap {
            shards: (0..shards)
                .map(|_| RwLock::new(HashMap::with_hasher(FnvBuildHasher::default())))
                .collect(),
            hasher: FnvBuildHasher::default(),
        }
    }

    /// Returns the number of shards.
    pub fn shards(&self) -> usize {
        self.shards.len()
    }
}

impl<K: Hash, V> ShardedMap<K, V> {
    fn shard(&self, key: &K) -> &Shard<K, V> {
        let hash = self.hasher.hash_one(key) as usize;
        &self.shards[hash & (self.shards.len() - 1)]
    }
}

// A panicking writer cannot leave a HashMap in an inconsistent state, so poisoned locks are
// simply taken over.
fn read<K, V>(shard: &Shard<K, V>) -> RwLockReadGuard<'_, HashMap<K, V, FnvBuildHasher>> {
    shard.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<K, V>(shard: &Shard<K, V>) -> RwLockWriteGuard<'_, HashMap<K, V, FnvBuildHasher>> {
    shard.write().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> ConcurrentMap<K, V> for ShardedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        read(self.shard(key)).get(key).cloned()
    }

    fn get_or_insert_with<F>(&self, key: K, factory: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        let shard = self.shard(&key);
        if let Some(value) = read(shard).get(&key) {
            return (value.clone(), true);
        }

        let mut entries = write(shard);
        match entries.get(&key) {
            Some(value) => (value.clone(), true),
            None => {
                let value = factory();
                let _ = entries.insert(key, value.clone());
                (value, false)
            }
        }
    }

    fn set(&self, key: K, value: V) {
        let _ = write(self.shard(&key)).insert(key, value);
    }

    fn remove_all(&self, keys: &[K]) {
        for key in keys {
            let _ = write(self.shard(key)).remove(key);
        }
    }

    fn remove_if<F>(&self, keys: &[K], predicate: F) -> usize
    where
        F: Fn(&V) -> bool,
    {
        let mut removed = 0;
        for key in keys {
            let mut entries = write(self.shard(key));
            if entries.get(key).is_some_and(&predicate) {
                let _ = entries.remove(key);
                removed += 1;
            }
        }

        removed
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        let mut result = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            result.extend(
                read(shard)
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
        }

        result
    }

    fn clear(&self) {
        for shard in self.shards.iter() {
            write(shard).clear();
        }
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| read(shard).len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use crate::map::{ConcurrentMap, ShardedMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn shard_counts_are_powers_of_two() {
        assert_eq!(ShardedMap::<u32, u32>::with_shards(0).shards(), 1);
        assert_eq!(ShardedMap::<u32, u32>::with_shards(5).shards(), 8);
        assert!(ShardedMap::<u32, u32>::new().shards().is_power_of_two());
    }

    #[test]
    fn keys_are_spread_and_found_again() {
        let map = ShardedMap::with_shards(4);
        for i in 0..1000 {
            map.set(i, i * 2);
        }

        assert_eq!(map.len(), 1000);
        assert_eq!(map.get(&500), Some(1000));
        assert_eq!(map.get(&1000), None);

        let keys: Vec<_> = (0..500).collect();
        map.remove_all(&keys);
        assert_eq!(map.len(), 500);
        assert_eq!(map.get(&499), None);
        assert_eq!(map.get(&501), Some(1002));

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn conditional_removal_checks_the_current_value() {
        let map = ShardedMap::with_shards(4);
        for i in 0..10 {
            map.set(i, i);
        }

        // A replaced value no longer matches...
        map.set(3, 100);
        let keys: Vec<_> = (0..10).collect();
        assert_eq!(map.remove_if(&keys, |value| *value < 5), 4);

        assert_eq!(map.len(), 6);
        assert_eq!(map.get(&3), Some(100));
        assert_eq!(map.get(&4), None);
        assert_eq!(map.remove_if(&[42], |_| true), 0);
    }

    #[test]
    fn concurrent_inserts_run_one_factory() {
        let map = Arc::new(ShardedMap::<&str, usize>::new());
        let factories = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let map = map.clone();
                let factories = factories.clone();
                std::thread::spawn(move || {
                    map.get_or_insert_with("key", || factories.fetch_add(1, Ordering::SeqCst))
                })
            })
            .collect();

        let inserted = threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .filter(|(value, existed)| {
                assert_eq!(*value, 0);
                !existed
            })
            .count();

        assert_eq!(inserted, 1);
        assert_eq!(factories.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshots_tolerate_concurrent_modification() {
        let map = ShardedMap::with_shards(2);
        map.set(1, "one");
        map.set(2, "two");

        let mut seen = 0;
        for (key, _) in map.snapshot() {
            map.remove_all(&[key]);
            map.set(key + 10, "moved");
            seen += 1;
        }

        assert_eq!(seen, 2);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&11), Some("moved"));
    }
}
