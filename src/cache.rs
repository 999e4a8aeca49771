use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use smallvec::SmallVec;
use triomphe::Arc as TrioArc;

use crate::{
    builder::CacheBuilder,
    common::time::{Clock, Instant},
    entry::CacheEntry,
    notification::{notifier::RemovalNotifier, RemovalCause, RemovalListener},
    policy::{EntryExpiration, Policy, Strength},
    slot::{ReclaimEvent, ReclaimableSlot},
    table::ShardedMap,
    value::CacheValue,
    value_initializer::{InitResult, ValueInitializer},
    ExpirationError,
};

pub(crate) type EntryRef<K, V> = TrioArc<CacheEntry<K, V>>;

/// A thread-safe, reference-aware expiring cache.
///
/// `Cache` stores its values behind reclaimable slots: readers receive strong
/// [`ValueRef`][value-ref] guards, while the cache itself decides through its
/// [`Strength`][strength] whether to pin values or let them live only as long
/// as their guards. Entries additionally expire on time-to-live and
/// time-to-idle rules, loader calls for the same missing key are collapsed
/// into a single flight, and an optional removal listener observes every
/// removal exactly once with its [`RemovalCause`][removal-cause].
///
/// All maintenance (purging reclaimed slots, releasing soft pins under
/// pressure) is piggybacked onto the calling threads; there is no background
/// thread.
///
/// [value-ref]: ./struct.ValueRef.html
/// [strength]: ./enum.Strength.html
/// [removal-cause]: ./notification/enum.RemovalCause.html
///
/// # Examples
///
/// Cache entries are manually added using [`insert`](#method.insert) or
/// [`get_with`](#method.get_with), and are stored in the cache until either
/// expired, reclaimed or manually invalidated.
///
/// Here's an example of reading and updating a cache by using multiple
/// threads:
///
/// ```rust
/// use refcache::Cache;
///
/// use std::thread;
///
/// fn value(n: usize) -> String {
///     format!("value {n}")
/// }
///
/// const NUM_THREADS: usize = 4;
/// const NUM_KEYS_PER_THREAD: usize = 16;
///
/// let cache = Cache::new();
///
/// // Spawn threads and read and update the cache simultaneously.
/// let threads: Vec<_> = (0..NUM_THREADS)
///     .map(|i| {
///         // To share the same cache across the threads, clone it.
///         // This is a cheap operation.
///         let my_cache = cache.clone();
///         let start = i * NUM_KEYS_PER_THREAD;
///         let end = (i + 1) * NUM_KEYS_PER_THREAD;
///
///         thread::spawn(move || {
///             for key in start..end {
///                 my_cache.insert(key, value(key));
///                 assert_eq!(
///                     my_cache.get(&key).and_then(|v| v.value().cloned()),
///                     Some(value(key))
///                 );
///             }
///
///             // Invalidate every 4 element of the inserted entries.
///             for key in (start..end).step_by(4) {
///                 my_cache.invalidate(&key);
///             }
///         })
///     })
///     .collect();
///
/// // Wait for all threads to complete.
/// threads.into_iter().for_each(|t| t.join().expect("Failed"));
///
/// // Verify the result.
/// for key in 0..(NUM_THREADS * NUM_KEYS_PER_THREAD) {
///     if key % 4 == 0 {
///         assert!(cache.get(&key).is_none());
///     } else {
///         assert_eq!(
///             cache.get(&key).and_then(|v| v.value().cloned()),
///             Some(value(key))
///         );
///     }
/// }
/// ```
pub struct Cache<K, V, S = RandomState> {
    inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
    /// Makes a clone of this shared cache.
    ///
    /// This operation is cheap as it only creates thread-safe reference
    /// counted pointers to the shared internal data structures.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Cache<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Constructs a new `Cache<K, V>` with the default configuration: soft
    /// strength, no default expirations and no pressure capacity.
    ///
    /// To adjust the configuration, use [`builder`](#method.builder) instead.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a [`CacheBuilder`][builder-struct], which can build a `Cache`
    /// with various configuration knobs.
    ///
    /// [builder-struct]: ./struct.CacheBuilder.html
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::default()
    }
}

impl<K, V> Default for Cache<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn with_everything(
        name: Option<String>,
        initial_capacity: Option<usize>,
        num_shards: usize,
        strength: Strength,
        pressure_capacity: Option<usize>,
        time_to_live: Option<Duration>,
        time_to_idle: Option<Duration>,
        removal_listener: Option<RemovalListener<K>>,
        build_hasher: S,
    ) -> Self {
        let (reclaim_tx, reclaim_rx) = unbounded();
        let table = ShardedMap::with_num_shards_and_hasher(
            num_shards,
            initial_capacity,
            build_hasher.clone(),
        );
        let notifier = removal_listener.map(|listener| RemovalNotifier::new(listener, name));
        let inner = Inner {
            table,
            value_initializer: ValueInitializer::with_hasher(build_hasher),
            reclaim_tx,
            reclaim_rx,
            notifier,
            clock: RwLock::new(Clock::default()),
            strength,
            pressure_capacity,
            time_to_live,
            time_to_idle,
            pinned_count: AtomicUsize::new(0),
            next_slot_id: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the configuration of this cache.
    pub fn policy(&self) -> Policy {
        Policy::new(
            self.inner.strength,
            self.inner.pressure_capacity,
            self.inner.time_to_live,
            self.inner.time_to_idle,
            self.inner.table.num_shards(),
        )
    }

    /// Returns the value for `key`, or `None` if the entry is absent, expired
    /// or reclaimed.
    ///
    /// An expired or reclaimed entry discovered here is also removed from the
    /// cache, firing the removal listener with `Expired` or `Reclaimed`. A
    /// successful read refreshes the entry's idle clock.
    pub fn get(&self, key: &K) -> Option<CacheValue<K, V>> {
        self.inner.run_pending_maintenance();
        self.inner.get_resolving(key)
    }

    /// Returns the value for `key`, running `init` to produce one if the
    /// entry is absent, expired or reclaimed.
    ///
    /// Concurrent calls for the same missing key are collapsed into a single
    /// flight: `init` runs exactly once and every caller receives the value
    /// it produced. Callers racing for *different* keys never block each
    /// other.
    ///
    /// `init` may decline by returning `None`, in which case nothing is
    /// cached and `None` is returned (to this caller and to everyone who
    /// waited on the flight); a later call will run its loader again. A new
    /// value is cached with the cache's default expirations.
    ///
    /// # Panics
    ///
    /// If `init` panics, the panic is propagated to this caller, nothing is
    /// cached, and waiting callers retry their own loaders.
    pub fn get_with(&self, key: K, init: impl FnOnce() -> Option<V>) -> Option<CacheValue<K, V>> {
        self.inner.run_pending_maintenance();
        let key = Arc::new(key);

        if let Some(value) = self.inner.get_resolving(&key) {
            return Some(value);
        }

        match self.inner.value_initializer.init_or_read(
            Arc::clone(&key),
            || self.inner.get_resolving(&key),
            init,
            |loaded| self.inner.install_loaded(Arc::clone(&key), loaded),
        ) {
            InitResult::Initialized(value) | InitResult::ReadExisting(value) => value,
            InitResult::InitErr(_) => panic!("Bug: never-failing flight reported an error"),
        }
    }

    /// Like [`get_with`](#method.get_with), but with a loader that can fail.
    ///
    /// On `Err` the error is returned to this caller and to every caller
    /// waiting on the same flight, wrapped in an `Arc`; nothing is cached and
    /// a later call will run its loader again.
    pub fn try_get_with<E>(
        &self,
        key: K,
        init: impl FnOnce() -> Result<Option<V>, E>,
    ) -> Result<Option<CacheValue<K, V>>, Arc<E>>
    where
        E: Send + Sync + 'static,
    {
        self.inner.run_pending_maintenance();
        let key = Arc::new(key);

        if let Some(value) = self.inner.get_resolving(&key) {
            return Ok(Some(value));
        }

        match self.inner.value_initializer.try_init_or_read(
            Arc::clone(&key),
            || self.inner.get_resolving(&key),
            init,
            |loaded| self.inner.install_loaded(Arc::clone(&key), loaded),
        ) {
            InitResult::Initialized(value) | InitResult::ReadExisting(value) => Ok(value),
            InitResult::InitErr(e) => Err(e),
        }
    }

    /// Inserts a value, replacing any previous entry for `key`, with the
    /// cache's default expirations.
    ///
    /// If a previous entry existed and was still live, its value is returned
    /// and the removal listener fires with `Replaced`; an already expired or
    /// reclaimed previous entry yields `None` and fires `Expired` or
    /// `Reclaimed` instead.
    ///
    /// Note that in a `Strength::Weak` cache nothing holds the new value
    /// after `insert` returns, so it becomes reclaimable immediately; weak
    /// caches are normally populated through [`get_with`](#method.get_with),
    /// which returns the guard that keeps the value alive.
    pub fn insert(&self, key: K, value: V) -> Option<CacheValue<K, V>> {
        self.inner.insert_payload(key, Some(value), None)
    }

    /// Like [`insert`](#method.insert), with per-entry expiration overrides.
    pub fn insert_with_expiration(
        &self,
        key: K,
        value: V,
        expiration: EntryExpiration,
    ) -> Option<CacheValue<K, V>> {
        self.inner.insert_payload(key, Some(value), Some(expiration))
    }

    /// Inserts a "no value" marker for `key` (negative caching), replacing
    /// any previous entry. A later [`get`](#method.get) returns
    /// `Some(CacheValue::Negative)`, distinct from the `None` of an absent
    /// key.
    ///
    /// The marker expires like any other entry but is never reclaimed.
    pub fn insert_negative(&self, key: K) -> Option<CacheValue<K, V>> {
        self.inner.insert_payload(key, None, None)
    }

    /// Like [`insert_negative`](#method.insert_negative), with per-entry
    /// expiration overrides.
    pub fn insert_negative_with_expiration(
        &self,
        key: K,
        expiration: EntryExpiration,
    ) -> Option<CacheValue<K, V>> {
        self.inner.insert_payload(key, None, Some(expiration))
    }

    /// Replaces the expiration of an existing entry and re-arms its expiry
    /// clocks, as if the entry had just been written.
    ///
    /// Returns `Ok(true)` if a live entry was re-armed. An entry that is
    /// already expired is removed (firing `Expired`) and `Ok(false)` is
    /// returned: an expired entry is never resurrected. An absent or
    /// reclaimed entry also yields `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Fails with [`ExpirationError::NoExpiration`][no-exp] when `expiration`
    /// carries neither axis and the cache has no default expirations, since
    /// such a call could never have an effect.
    ///
    /// [no-exp]: ./enum.ExpirationError.html#variant.NoExpiration
    pub fn set_expiration(
        &self,
        key: &K,
        expiration: EntryExpiration,
    ) -> Result<bool, ExpirationError> {
        let inner = &self.inner;
        if expiration.is_unset() && inner.time_to_live.is_none() && inner.time_to_idle.is_none() {
            return Err(ExpirationError::NoExpiration);
        }

        inner.run_pending_maintenance();
        let now = inner.current_time();
        let entry = match inner.table.get(key) {
            Some(entry) => entry,
            None => return Ok(false),
        };

        if entry.slot().is_cleared() {
            inner.remove_if_same(&entry, RemovalCause::Reclaimed);
            return Ok(false);
        }
        if entry.is_expired(inner.time_to_live, inner.time_to_idle, now) {
            inner.remove_if_same(&entry, RemovalCause::Expired);
            return Ok(false);
        }

        entry.rearm(now, expiration);
        Ok(true)
    }

    /// Discards the entry for `key` if present, eagerly clearing its value
    /// slot and firing the removal listener with `Explicit`.
    pub fn invalidate(&self, key: &K) {
        self.inner.run_pending_maintenance();
        if let Some(entry) = self.inner.table.remove(key) {
            self.inner.unlink(&entry, RemovalCause::Explicit);
        }
    }

    /// Discards every entry for which `predicate` returns `true`, firing the
    /// removal listener with `Explicit` for each. Returns the number of
    /// entries discarded this way.
    ///
    /// Expiry and reclamation are resolved per entry *before* the predicate
    /// sees it: an entry that was already dead at call time is removed with
    /// `Expired`/`Reclaimed` and the predicate is never shown its value.
    /// Negative entries are presented to the predicate with a `None` value.
    pub fn invalidate_entries_if(
        &self,
        mut predicate: impl FnMut(&K, Option<&V>) -> bool,
    ) -> usize {
        let inner = &self.inner;
        inner.run_pending_maintenance();
        let now = inner.current_time();
        let mut invalidated = 0;

        for shard_index in 0..inner.table.num_shards() {
            for (key, entry) in inner.table.shard_snapshot(shard_index) {
                // Capture the value before judging the entry.
                let value = match entry.slot().probe() {
                    Some(value) => value,
                    None => {
                        inner.remove_if_same(&entry, RemovalCause::Reclaimed);
                        continue;
                    }
                };
                if entry.is_expired(inner.time_to_live, inner.time_to_idle, now) {
                    inner.remove_if_same(&entry, RemovalCause::Expired);
                    continue;
                }
                if predicate(&key, value.value())
                    && inner.remove_if_same(&entry, RemovalCause::Explicit)
                {
                    invalidated += 1;
                }
            }
        }
        invalidated
    }

    /// Discards all entries, firing the removal listener with `Explicit` for
    /// every live one.
    pub fn invalidate_all(&self) {
        self.invalidate_entries_if(|_, _| true);
    }

    /// Returns the number of entries in the cache, after purging pending
    /// reclamations.
    ///
    /// The count is a best-effort approximation: an entry whose value was
    /// reclaimed a moment ago may still be counted until a later maintenance
    /// pass observes it.
    pub fn entry_count(&self) -> usize {
        self.inner.run_pending_maintenance();
        self.inner.table.len()
    }

    #[cfg(test)]
    pub(crate) fn set_expiration_clock(&self, clock: Clock) {
        *self.inner.clock.write() = clock;
    }

    #[cfg(test)]
    pub(crate) fn pinned_count(&self) -> usize {
        self.inner.pinned_count.load(Ordering::Acquire)
    }
}

struct Inner<K, V, S> {
    table: ShardedMap<K, EntryRef<K, V>, S>,
    value_initializer: ValueInitializer<K, V, S>,
    reclaim_tx: Sender<ReclaimEvent<K>>,
    reclaim_rx: Receiver<ReclaimEvent<K>>,
    notifier: Option<RemovalNotifier<K>>,
    clock: RwLock<Clock>,
    strength: Strength,
    pressure_capacity: Option<usize>,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    /// Number of slots currently holding a soft pin. Drives the pressure
    /// pass; only a heuristic, never used for correctness decisions.
    pinned_count: AtomicUsize,
    next_slot_id: AtomicU64,
}

impl<K, V, S> Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn current_time(&self) -> Instant {
        self.clock.read().now()
    }

    /// Purges entries whose slots were reclaimed, then releases soft pins if
    /// the cache is over its pressure capacity. Invoked at the start of every
    /// public operation; safe to run from any number of threads at once.
    fn run_pending_maintenance(&self) {
        self.drain_reclaimed();
        if self.enforce_pressure() {
            // Pins released without outstanding guards have already posted
            // their reclamation events; purge them right away.
            self.drain_reclaimed();
        }
    }

    /// Consumes the reclamation queue. Each event is handed to exactly one
    /// thread by the channel; the removal itself is idempotent, and the slot
    /// id check drops events that outlived their entry (the entry was
    /// replaced or removed before its old value's reclamation was observed).
    fn drain_reclaimed(&self) {
        while let Ok(event) = self.reclaim_rx.try_recv() {
            if let Some(entry) = self.table.get(&event.key) {
                if entry.slot().id() == event.slot_id {
                    self.remove_if_same(&entry, RemovalCause::Reclaimed);
                }
            }
        }
    }

    /// Releases soft pins, oldest last access first, until the pinned count
    /// is back at the pressure capacity. Returns `true` if any pin was
    /// released.
    fn enforce_pressure(&self) -> bool {
        let capacity = match self.pressure_capacity {
            Some(capacity) if self.strength == Strength::Soft => capacity,
            _ => return false,
        };
        if self.pinned_count.load(Ordering::Acquire) <= capacity {
            return false;
        }

        let mut pinned: SmallVec<[(Instant, EntryRef<K, V>); 64]> = SmallVec::new();
        for shard_index in 0..self.table.num_shards() {
            for (_key, entry) in self.table.shard_snapshot(shard_index) {
                if entry.slot().is_pinned() {
                    let accessed = entry.last_accessed().unwrap_or(Instant::from_nanos(0));
                    pinned.push((accessed, entry));
                }
            }
        }
        pinned.sort_by_key(|(accessed, _)| *accessed);

        let excess = pinned.len().saturating_sub(capacity);
        let mut released = false;
        for (_, entry) in pinned.into_iter().take(excess) {
            if entry.slot().release_pin() {
                self.pinned_count.fetch_sub(1, Ordering::AcqRel);
                released = true;
            }
        }
        released
    }

    /// `get` without the leading maintenance pass. Resolves (removes and
    /// notifies) an expired or reclaimed entry it finds.
    fn get_resolving(&self, key: &K) -> Option<CacheValue<K, V>> {
        let now = self.current_time();
        let entry = self.table.get(key)?;

        // Capture the strong guard before judging the entry, so the host's
        // reclamation of the slot cannot tear this read.
        let value = match entry.slot().probe() {
            Some(value) => value,
            None => {
                self.remove_if_same(&entry, RemovalCause::Reclaimed);
                return None;
            }
        };
        if entry.is_expired(self.time_to_live, self.time_to_idle, now) {
            self.remove_if_same(&entry, RemovalCause::Expired);
            return None;
        }

        entry.set_last_accessed(now);
        Some(value)
    }

    fn insert_payload(
        &self,
        key: K,
        payload: Option<V>,
        expiration: Option<EntryExpiration>,
    ) -> Option<CacheValue<K, V>> {
        self.run_pending_maintenance();
        let now = self.current_time();
        let key = Arc::new(key);

        let (entry, _guard) = self.make_entry(Arc::clone(&key), payload, now, expiration);
        let displaced = self.table.insert(key, entry);
        displaced.and_then(|old| self.resolve_displaced(old, now))
    }

    /// Installs a freshly loaded value with the default expirations and
    /// returns the guard that keeps it alive for the loading caller.
    fn install_loaded(&self, key: Arc<K>, value: V) -> CacheValue<K, V> {
        let now = self.current_time();
        let (entry, guard) = self.make_entry(Arc::clone(&key), Some(value), now, None);
        if let Some(old) = self.table.insert(key, entry) {
            self.resolve_displaced(old, now);
        }
        guard
    }

    /// Builds a new entry around a fresh slot, returning the value handle the
    /// slot was created with.
    fn make_entry(
        &self,
        key: Arc<K>,
        payload: Option<V>,
        now: Instant,
        expiration: Option<EntryExpiration>,
    ) -> (EntryRef<K, V>, CacheValue<K, V>) {
        let slot_id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        match payload {
            None => {
                let slot = ReclaimableSlot::negative(slot_id);
                let entry = TrioArc::new(CacheEntry::new(key, slot, now, expiration));
                (entry, CacheValue::Negative)
            }
            Some(value) => {
                let (slot, guard) = ReclaimableSlot::with_value(
                    slot_id,
                    Arc::clone(&key),
                    value,
                    self.strength,
                    &self.reclaim_tx,
                );
                if slot.is_pinned() {
                    self.pinned_count.fetch_add(1, Ordering::AcqRel);
                }
                let entry = TrioArc::new(CacheEntry::new(key, slot, now, expiration));
                (entry, CacheValue::Value(guard))
            }
        }
    }

    /// Settles an entry that was displaced from the table by an insert.
    /// Returns its value when it was still live (the `Replaced` case).
    fn resolve_displaced(&self, old: EntryRef<K, V>, now: Instant) -> Option<CacheValue<K, V>> {
        // Capture the old value before clearing the slot.
        let (cause, displaced_value) = match old.slot().probe() {
            None => (RemovalCause::Reclaimed, None),
            Some(value) => {
                if old.is_expired(self.time_to_live, self.time_to_idle, now) {
                    (RemovalCause::Expired, None)
                } else {
                    (RemovalCause::Replaced, Some(value))
                }
            }
        };
        self.unlink(&old, cause);
        displaced_value
    }

    /// Removes the key only while it still maps to this exact entry, so a
    /// removal decided against a stale entry can never take out a
    /// replacement. Returns `true` if this call performed the removal.
    fn remove_if_same(&self, entry: &EntryRef<K, V>, cause: RemovalCause) -> bool {
        let removed = self
            .table
            .remove_if(entry.key(), |current| TrioArc::ptr_eq(current, entry))
            .is_some();
        if removed {
            self.unlink(entry, cause);
        }
        removed
    }

    /// Finishes the removal of an entry that is no longer in the table:
    /// eagerly clears its slot and fires the removal listener, guarded by the
    /// entry's once-only notification latch.
    fn unlink(&self, entry: &EntryRef<K, V>, cause: RemovalCause) {
        if entry.slot().clear() {
            self.pinned_count.fetch_sub(1, Ordering::AcqRel);
        }
        if entry.begin_notify() {
            if let Some(notifier) = &self.notifier {
                notifier.notify(Arc::clone(entry.key()), cause);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Cache;
    use crate::{
        common::time::Clock, notification::RemovalCause, policy::EntryExpiration,
        policy::Strength, ExpirationError,
    };

    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier, Mutex,
        },
        thread,
        time::Duration,
    };

    type Recorded<K> = Arc<Mutex<Vec<(K, RemovalCause)>>>;

    fn recording_listener<K: Clone + Send + Sync + 'static>(
    ) -> (crate::RemovalListener<K>, Recorded<K>) {
        let recorded: Recorded<K> = Arc::default();
        let rec = Arc::clone(&recorded);
        let listener: crate::RemovalListener<K> = Arc::new(move |key: Arc<K>, cause| {
            rec.lock().expect("lock").push(((*key).clone(), cause));
        });
        (listener, recorded)
    }

    #[test]
    fn basic_single_thread() {
        let cache = Cache::new();

        cache.insert("a", "alice");
        cache.insert("b", "bob");
        assert_eq!(
            cache.get(&"a").and_then(|v| v.value().copied()),
            Some("alice")
        );
        assert_eq!(cache.get(&"b").and_then(|v| v.value().copied()), Some("bob"));
        assert_eq!(cache.entry_count(), 2);

        cache.invalidate(&"b");
        assert!(cache.get(&"b").is_none());
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn basic_multi_threads() {
        let cache = Cache::new();

        let threads: Vec<_> = (0..4u32)
            .map(|t| {
                let my_cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..64u32 {
                        let key = t * 1000 + i;
                        my_cache.insert(key, key * 2);
                        assert_eq!(
                            my_cache.get(&key).and_then(|v| v.value().copied()),
                            Some(key * 2)
                        );
                    }
                })
            })
            .collect();
        threads.into_iter().for_each(|t| t.join().expect("Failed"));

        assert_eq!(cache.entry_count(), 4 * 64);
    }

    #[test]
    fn no_duplicate_load_under_contention() {
        const NUM_THREADS: usize = 8;

        let cache: Cache<u32, String> = Cache::new();
        let load_count = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let cache = cache.clone();
                let load_count = Arc::clone(&load_count);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let value = cache
                        .get_with(99, || {
                            load_count.fetch_add(1, Ordering::AcqRel);
                            // Give the other threads time to pile onto the
                            // flight.
                            thread::sleep(Duration::from_millis(50));
                            Some("loaded".to_string())
                        })
                        .expect("flight produced no value");
                    value.value().cloned().expect("not a negative entry")
                })
            })
            .collect();

        let values: Vec<_> = threads
            .into_iter()
            .map(|t| t.join().expect("Failed"))
            .collect();

        assert_eq!(load_count.load(Ordering::Acquire), 1);
        assert!(values.iter().all(|v| v == "loaded"));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn declining_loader_caches_nothing() {
        let cache: Cache<u32, u32> = Cache::new();
        let load_count = Arc::new(AtomicUsize::new(0));

        let lc = Arc::clone(&load_count);
        assert!(cache
            .get_with(1, || {
                lc.fetch_add(1, Ordering::AcqRel);
                None
            })
            .is_none());
        assert_eq!(cache.entry_count(), 0);

        // The declined flight left nothing behind, so a later call loads
        // again.
        let lc = Arc::clone(&load_count);
        let value = cache.get_with(1, || {
            lc.fetch_add(1, Ordering::AcqRel);
            Some(7)
        });
        assert_eq!(value.and_then(|v| v.value().copied()), Some(7));
        assert_eq!(load_count.load(Ordering::Acquire), 2);
    }

    #[test]
    fn failing_loader_propagates_and_caches_nothing() {
        let cache: Cache<u32, u32> = Cache::new();

        let result = cache.try_get_with(1, || Err(anyhow::anyhow!("backend down")));
        let err = result.expect_err("loader error must propagate");
        assert_eq!(err.to_string(), "backend down");
        assert_eq!(cache.entry_count(), 0);

        // A retry re-invokes the loader.
        let result: Result<_, Arc<anyhow::Error>> = cache.try_get_with(1, || Ok(Some(5)));
        let value = result.expect("retry must succeed");
        assert_eq!(value.and_then(|v| v.value().copied()), Some(5));
    }

    #[test]
    fn ttl_expiry() {
        let (listener, recorded) = recording_listener();
        let cache: Cache<&str, &str> = Cache::builder()
            .time_to_live(Duration::from_secs(10))
            .removal_listener_arc(listener)
            .build();
        let (clock, mock) = Clock::mock();
        cache.set_expiration_clock(clock);

        cache.insert("a", "alice");

        mock.increment(Duration::from_secs(5));
        assert_eq!(
            cache.get(&"a").and_then(|v| v.value().copied()),
            Some("alice")
        );

        // Reads do not extend the write deadline.
        mock.increment(Duration::from_secs(5));
        assert!(cache.get(&"a").is_none());
        assert_eq!(cache.entry_count(), 0);

        let recorded = recorded.lock().expect("lock");
        assert_eq!(&*recorded, &[("a", RemovalCause::Expired)]);
    }

    #[test]
    fn tti_expiry_refreshed_by_reads() {
        let cache: Cache<&str, &str> = Cache::builder()
            .time_to_idle(Duration::from_secs(10))
            .build();
        let (clock, mock) = Clock::mock();
        cache.set_expiration_clock(clock);

        cache.insert("a", "alice");

        for _ in 0..3 {
            mock.increment(Duration::from_secs(8));
            assert!(cache.get(&"a").is_some());
        }

        mock.increment(Duration::from_secs(10));
        assert!(cache.get(&"a").is_none());
    }

    #[test]
    fn per_entry_expiration_beats_default() {
        let cache: Cache<&str, &str> = Cache::builder()
            .time_to_live(Duration::from_secs(100))
            .build();
        let (clock, mock) = Clock::mock();
        cache.set_expiration_clock(clock);

        cache.insert("long", "l");
        cache.insert_with_expiration(
            "short",
            "s",
            EntryExpiration::new().time_to_live(Duration::from_secs(5)),
        );
        cache.insert_with_expiration(
            "forever",
            "f",
            EntryExpiration::new().time_to_live(Duration::MAX),
        );

        mock.increment(Duration::from_secs(50));
        assert!(cache.get(&"long").is_some());
        assert!(cache.get(&"short").is_none());
        assert!(cache.get(&"forever").is_some());

        mock.increment(Duration::from_secs(100));
        assert!(cache.get(&"long").is_none());
        assert!(cache.get(&"forever").is_some());
    }

    #[test]
    fn negative_entries_are_distinct_from_misses() {
        let cache: Cache<&str, u32> = Cache::new();

        cache.insert_negative("known-empty");

        let hit = cache.get(&"known-empty").expect("entry must be present");
        assert!(hit.is_negative());
        assert_eq!(hit.value(), None);

        assert!(cache.get(&"never-seen").is_none());
        assert_eq!(cache.entry_count(), 1);

        // A negative entry expires like any other.
        let cache: Cache<&str, u32> = Cache::builder()
            .time_to_live(Duration::from_secs(1))
            .build();
        let (clock, mock) = Clock::mock();
        cache.set_expiration_clock(clock);
        cache.insert_negative("known-empty");
        mock.increment(Duration::from_secs(2));
        assert!(cache.get(&"known-empty").is_none());
    }

    #[test]
    fn weak_value_reclaimed_once_after_last_guard_drops() {
        let (listener, recorded) = recording_listener();
        let cache: Cache<u32, String> = Cache::builder()
            .strength(Strength::Weak)
            .removal_listener_arc(listener)
            .build();

        let guard = cache
            .get_with(1, || Some("held".to_string()))
            .expect("loaded")
            .into_value_ref()
            .expect("not negative");

        // The value stays cached while the guard is alive.
        assert!(cache.get(&1).is_some());
        assert_eq!(cache.entry_count(), 1);
        assert!(recorded.lock().expect("lock").is_empty());

        drop(guard);

        // Any number of maintenance-triggering calls later, the listener has
        // fired exactly once.
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.entry_count(), 0);
        let _ = cache.entry_count();
        assert_eq!(
            &*recorded.lock().expect("lock"),
            &[(1, RemovalCause::Reclaimed)]
        );
    }

    #[test]
    fn set_expiration_rearms_live_entries() {
        let cache: Cache<&str, &str> = Cache::builder()
            .time_to_live(Duration::from_secs(10))
            .build();
        let (clock, mock) = Clock::mock();
        cache.set_expiration_clock(clock);

        cache.insert("a", "alice");
        mock.increment(Duration::from_secs(8));
        assert!(matches!(
            cache.set_expiration(
                &"a",
                EntryExpiration::new().time_to_live(Duration::from_secs(10))
            ),
            Ok(true)
        ));

        // The clock was re-armed at t=8, so the entry lives until t=18.
        mock.increment(Duration::from_secs(8));
        assert!(cache.get(&"a").is_some());
        mock.increment(Duration::from_secs(3));
        assert!(cache.get(&"a").is_none());
    }

    #[test]
    fn set_expiration_never_resurrects_expired_entries() {
        let (listener, recorded) = recording_listener();
        let cache: Cache<&str, &str> = Cache::builder()
            .time_to_live(Duration::from_secs(10))
            .removal_listener_arc(listener)
            .build();
        let (clock, mock) = Clock::mock();
        cache.set_expiration_clock(clock);

        cache.insert("a", "alice");
        mock.increment(Duration::from_secs(11));

        assert!(matches!(
            cache.set_expiration(
                &"a",
                EntryExpiration::new().time_to_live(Duration::from_secs(100))
            ),
            Ok(false)
        ));
        assert!(cache.get(&"a").is_none());
        assert_eq!(
            &*recorded.lock().expect("lock"),
            &[("a", RemovalCause::Expired)]
        );
    }

    #[test]
    fn set_expiration_requires_some_axis() {
        let cache: Cache<&str, &str> = Cache::new();
        cache.insert("a", "alice");

        assert!(matches!(
            cache.set_expiration(&"a", EntryExpiration::new()),
            Err(ExpirationError::NoExpiration)
        ));

        // With a cache-wide default the bare override is meaningful: it
        // reverts the entry to the default.
        let cache: Cache<&str, &str> = Cache::builder()
            .time_to_live(Duration::from_secs(10))
            .build();
        cache.insert("a", "alice");
        assert!(matches!(
            cache.set_expiration(&"a", EntryExpiration::new()),
            Ok(true)
        ));
    }

    #[test]
    fn invalidate_entries_if_resolves_dead_entries_first() {
        let (listener, recorded) = recording_listener();
        let cache: Cache<&str, u32> = Cache::builder()
            .removal_listener_arc(listener)
            .build();
        let (clock, mock) = Clock::mock();
        cache.set_expiration_clock(clock);

        cache.insert("live-match", 1);
        cache.insert("live-other", 2);
        cache.insert_with_expiration(
            "dead",
            3,
            EntryExpiration::new().time_to_live(Duration::from_secs(1)),
        );
        mock.increment(Duration::from_secs(5));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let invalidated = cache.invalidate_entries_if(move |key, value| {
            seen_clone
                .lock()
                .expect("lock")
                .push((*key, value.copied()));
            *key == "live-match"
        });

        assert_eq!(invalidated, 1);
        assert_eq!(cache.entry_count(), 1);

        // The predicate never saw the expired entry.
        let mut seen = seen.lock().expect("lock").clone();
        seen.sort_by_key(|(key, _)| *key);
        assert_eq!(
            seen,
            vec![("live-match", Some(1)), ("live-other", Some(2))]
        );

        let mut causes = recorded.lock().expect("lock").clone();
        causes.sort_by_key(|(key, _)| *key);
        assert_eq!(
            causes,
            vec![
                ("dead", RemovalCause::Expired),
                ("live-match", RemovalCause::Explicit),
            ]
        );
    }

    #[test]
    fn invalidate_all_empties_the_cache() {
        let (listener, recorded) = recording_listener();
        let cache: Cache<u32, u32> = Cache::builder()
            .removal_listener_arc(listener)
            .build();

        for i in 0..10 {
            cache.insert(i, i);
        }
        cache.invalidate_all();

        assert_eq!(cache.entry_count(), 0);
        let recorded = recorded.lock().expect("lock");
        assert_eq!(recorded.len(), 10);
        assert!(recorded
            .iter()
            .all(|(_, cause)| *cause == RemovalCause::Explicit));
    }

    #[test]
    fn replace_returns_old_value_and_notifies_once() {
        let (listener, recorded) = recording_listener();
        let cache: Cache<&str, u32> = Cache::builder()
            .removal_listener_arc(listener)
            .build();

        assert!(cache.insert("a", 1).is_none());
        let old = cache.insert("a", 2).expect("previous value");
        assert_eq!(old.value(), Some(&1));

        assert_eq!(cache.get(&"a").and_then(|v| v.value().copied()), Some(2));
        assert_eq!(
            &*recorded.lock().expect("lock"),
            &[("a", RemovalCause::Replaced)]
        );
    }

    #[test]
    fn negative_entry_replacement() {
        let cache: Cache<&str, u32> = Cache::new();

        cache.insert_negative("a");
        let old = cache.insert("a", 1).expect("negative entry was present");
        assert!(old.is_negative());
        assert_eq!(cache.get(&"a").and_then(|v| v.value().copied()), Some(1));
    }

    #[test]
    fn pressure_pass_releases_oldest_pins() {
        let (listener, recorded) = recording_listener();
        let cache: Cache<&str, u32> = Cache::builder()
            .strength(Strength::Soft)
            .pressure_capacity(2)
            .removal_listener_arc(listener)
            .build();
        let (clock, mock) = Clock::mock();
        cache.set_expiration_clock(clock);

        cache.insert("oldest", 1);
        mock.increment(Duration::from_secs(1));
        cache.insert("middle", 2);
        mock.increment(Duration::from_secs(1));
        cache.insert("newest", 3);
        assert_eq!(cache.pinned_count(), 3);

        // The next operation's maintenance pass releases the oldest pin; with
        // no guards outstanding the value dies immediately and the entry is
        // purged.
        assert!(cache.get(&"middle").is_some());
        assert_eq!(cache.pinned_count(), 2);
        assert!(cache.get(&"oldest").is_none());
        assert_eq!(cache.entry_count(), 2);
        assert_eq!(
            &*recorded.lock().expect("lock"),
            &[("oldest", RemovalCause::Reclaimed)]
        );
    }

    #[test]
    fn soft_without_pressure_capacity_never_releases() {
        let cache: Cache<u32, u32> = Cache::new();
        for i in 0..100 {
            cache.insert(i, i);
        }
        assert_eq!(cache.pinned_count(), 100);
        assert_eq!(cache.entry_count(), 100);
    }

    #[test]
    fn panicking_listener_does_not_poison_the_cache() {
        let _ = env_logger::builder().is_test(true).try_init();

        let cache: Cache<u32, u32> = Cache::builder()
            .name("panicking-listener-cache")
            .removal_listener(|_key, _cause| panic!("listener boom"))
            .build();

        cache.insert(1, 1);
        cache.invalidate(&1);

        // The cache keeps working after the listener panicked and was
        // disabled.
        cache.insert(2, 2);
        cache.invalidate(&2);
        cache.insert(3, 3);
        assert_eq!(cache.get(&3).and_then(|v| v.value().copied()), Some(3));
    }

    #[test]
    fn build_with_hasher() {
        let cache: Cache<u32, u32, ahash::RandomState> = Cache::builder()
            .build_with_hasher(ahash::RandomState::new());
        cache.insert(1, 10);
        assert_eq!(cache.get(&1).and_then(|v| v.value().copied()), Some(10));
    }
}
