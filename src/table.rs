use std::{
    collections::HashMap,
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// A concurrent `Arc<K>`-keyed map, sharded over a power-of-two array of
/// mutex-guarded hash maps.
///
/// Every operation locks exactly one shard, so per-key operations are atomic
/// while unrelated keys on other shards proceed in parallel. A `Mutex` (not an
/// `RwLock`) guards each shard: the structural operations the cache needs are
/// all writes, and the lock is never held across user code.
pub(crate) struct ShardedMap<K, T, S> {
    shards: Box<[CachePadded<Mutex<HashMap<Arc<K>, T>>>]>,
    build_hasher: S,
}

impl<K, T, S> ShardedMap<K, T, S>
where
    K: Hash + Eq,
    T: Clone,
    S: BuildHasher,
{
    /// `num_shards` is rounded up to a power of two. The `initial_capacity`
    /// hint is spread evenly across the shards.
    pub(crate) fn with_num_shards_and_hasher(
        num_shards: usize,
        initial_capacity: Option<usize>,
        build_hasher: S,
    ) -> Self {
        let num_shards = num_shards.max(1).next_power_of_two();
        let shard_capacity = initial_capacity
            .map(|cap| (cap + num_shards - 1) / num_shards)
            .unwrap_or(0);
        let shards = (0..num_shards)
            .map(|_| CachePadded::new(Mutex::new(HashMap::with_capacity(shard_capacity))))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            build_hasher,
        }
    }

    pub(crate) fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &K) -> &Mutex<HashMap<Arc<K>, T>> {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        // `shards.len()` is a power of two.
        let index = (hasher.finish() as usize) & (self.shards.len() - 1);
        &self.shards[index]
    }

    pub(crate) fn get(&self, key: &K) -> Option<T> {
        self.shard_for(key).lock().get(key).cloned()
    }

    /// Inserts `value`, returning the displaced value if the key was present.
    pub(crate) fn insert(&self, key: Arc<K>, value: T) -> Option<T> {
        self.shard_for(&key).lock().insert(key, value)
    }

    /// Inserts `value` only if the key is absent. Returns the already present
    /// value otherwise.
    pub(crate) fn try_insert(&self, key: Arc<K>, value: T) -> Option<T> {
        use std::collections::hash_map::Entry;

        match self.shard_for(&key).lock().entry(key) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                None
            }
        }
    }

    pub(crate) fn remove(&self, key: &K) -> Option<T> {
        self.shard_for(key).lock().remove(key)
    }

    /// Removes the key only if its current value satisfies `pred`. Callers use
    /// this with a pointer-identity predicate so a removal meant for one entry
    /// can never take out a replacement that was installed in the meantime.
    pub(crate) fn remove_if(&self, key: &K, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut shard = self.shard_for(key).lock();
        if shard.get(key).is_some_and(pred) {
            shard.remove(key)
        } else {
            None
        }
    }

    /// Snapshots one shard's entries. The shard lock is released before the
    /// caller looks at the result, so entries may be gone by then; sweep
    /// callers re-check with `remove_if`.
    pub(crate) fn shard_snapshot(&self, shard_index: usize) -> Vec<(Arc<K>, T)> {
        self.shards[shard_index]
            .lock()
            .iter()
            .map(|(k, v)| (Arc::clone(k), v.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::ShardedMap;

    use std::{collections::hash_map::RandomState, sync::Arc, thread};

    fn map() -> ShardedMap<u32, u32, RandomState> {
        ShardedMap::with_num_shards_and_hasher(8, Some(64), RandomState::default())
    }

    #[test]
    fn rounds_shards_up_to_power_of_two() {
        let map: ShardedMap<u32, u32, RandomState> =
            ShardedMap::with_num_shards_and_hasher(5, None, RandomState::default());
        assert_eq!(map.num_shards(), 8);
    }

    #[test]
    fn insert_get_remove() {
        let map = map();
        assert_eq!(map.insert(Arc::new(1), 10), None);
        assert_eq!(map.insert(Arc::new(1), 11), Some(10));
        assert_eq!(map.get(&1), Some(11));
        assert_eq!(map.remove(&1), Some(11));
        assert_eq!(map.get(&1), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn try_insert_keeps_first_value() {
        let map = map();
        assert_eq!(map.try_insert(Arc::new(1), 10), None);
        assert_eq!(map.try_insert(Arc::new(1), 11), Some(10));
        assert_eq!(map.get(&1), Some(10));
    }

    #[test]
    fn remove_if_checks_current_value() {
        let map = map();
        map.insert(Arc::new(1), 10);
        assert_eq!(map.remove_if(&1, |v| *v == 99), None);
        assert_eq!(map.get(&1), Some(10));
        assert_eq!(map.remove_if(&1, |v| *v == 10), Some(10));
        assert_eq!(map.get(&1), None);
        // Removing an already removed key is a no-op.
        assert_eq!(map.remove_if(&1, |_| true), None);
    }

    #[test]
    fn concurrent_inserts_land_once_each() {
        let map = Arc::new(map());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..256u32 {
                        map.insert(Arc::new(t * 1000 + i), i);
                    }
                })
            })
            .collect();
        threads.into_iter().for_each(|t| t.join().expect("Failed"));
        assert_eq!(map.len(), 4 * 256);
    }
}
