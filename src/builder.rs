use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};

use crate::{
    cache::Cache,
    common::default_num_shards,
    notification::{RemovalCause, RemovalListener},
    policy::Strength,
};

/// Builds a [`Cache`][cache-struct] with various configuration knobs.
///
/// [cache-struct]: ./struct.Cache.html
///
/// # Examples
///
/// ```rust
/// use refcache::{Cache, Strength};
///
/// use std::time::Duration;
///
/// let cache: Cache<String, String> = Cache::builder()
///     // Keep values pinned until more than 10,000 of them are held.
///     .strength(Strength::Soft)
///     .pressure_capacity(10_000)
///     // Time to live (TTL): 30 minutes
///     .time_to_live(Duration::from_secs(30 * 60))
///     // Time to idle (TTI):  5 minutes
///     .time_to_idle(Duration::from_secs(5 * 60))
///     // Create the cache.
///     .build();
///
/// // This entry will expire after 5 minutes (TTI) if there is no get().
/// cache.insert("key".to_string(), "value".to_string());
///
/// // This get() will extend the entry life for another 5 minutes.
/// cache.get(&"key".to_string());
///
/// // Even though we keep calling get(), the entry will expire
/// // after 30 minutes (TTL) from the insert().
/// ```
pub struct CacheBuilder<K, V> {
    name: Option<String>,
    initial_capacity: Option<usize>,
    num_shards: Option<usize>,
    strength: Strength,
    pressure_capacity: Option<usize>,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    removal_listener: Option<RemovalListener<K>>,
    value_type: PhantomData<V>,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            name: None,
            initial_capacity: None,
            num_shards: None,
            strength: Strength::default(),
            pressure_capacity: None,
            time_to_live: None,
            time_to_idle: None,
            removal_listener: None,
            value_type: PhantomData,
        }
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Construct a new `CacheBuilder` with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the cache, used to tag its log messages.
    pub fn name(self, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }

    /// Sets the initial capacity hint (number of entries) of the cache.
    pub fn initial_capacity(self, capacity: usize) -> Self {
        Self {
            initial_capacity: Some(capacity),
            ..self
        }
    }

    /// Sets the number of shards of the cache's hash table. It will be
    /// rounded up to a power of two. Defaults to a multiple of the number of
    /// available CPU cores.
    pub fn num_shards(self, num_shards: usize) -> Self {
        Self {
            num_shards: Some(num_shards),
            ..self
        }
    }

    /// Sets the reference strength the cache keeps on its values.
    pub fn strength(self, strength: Strength) -> Self {
        Self { strength, ..self }
    }

    /// Sets the number of pinned values above which a `Strength::Soft` cache
    /// starts releasing its pins, oldest access first.
    ///
    /// Has no effect on a `Strength::Weak` cache.
    pub fn pressure_capacity(self, capacity: usize) -> Self {
        Self {
            pressure_capacity: Some(capacity),
            ..self
        }
    }

    /// Sets the default time to live of the cache.
    ///
    /// A cached entry will be expired after the specified duration past from
    /// `insert`.
    pub fn time_to_live(self, duration: Duration) -> Self {
        Self {
            time_to_live: Some(duration),
            ..self
        }
    }

    /// Sets the default time to idle of the cache.
    ///
    /// A cached entry will be expired after the specified duration past from
    /// `get` or `insert`.
    pub fn time_to_idle(self, duration: Duration) -> Self {
        Self {
            time_to_idle: Some(duration),
            ..self
        }
    }

    /// Sets the removal listener of the cache, called once for every removed
    /// entry with the key and the [`RemovalCause`][removal-cause].
    ///
    /// A panic in the listener is caught and disables the listener; it never
    /// poisons the cache itself.
    ///
    /// [removal-cause]: ./notification/enum.RemovalCause.html
    pub fn removal_listener(
        self,
        listener: impl Fn(Arc<K>, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        self.removal_listener_arc(Arc::new(listener))
    }

    /// Sets an already shared removal listener.
    pub fn removal_listener_arc(self, listener: RemovalListener<K>) -> Self {
        Self {
            removal_listener: Some(listener),
            ..self
        }
    }

    /// Builds a `Cache<K, V>`.
    pub fn build(self) -> Cache<K, V, RandomState> {
        self.build_with_hasher(RandomState::default())
    }

    /// Builds a `Cache<K, V, S>` with the given `hasher`.
    pub fn build_with_hasher<S>(self, hasher: S) -> Cache<K, V, S>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        Cache::with_everything(
            self.name,
            self.initial_capacity,
            self.num_shards.unwrap_or_else(default_num_shards),
            self.strength,
            self.pressure_capacity,
            self.time_to_live,
            self.time_to_idle,
            self.removal_listener,
            hasher,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::CacheBuilder;
    use crate::policy::Strength;

    use std::time::Duration;

    #[test]
    fn build_cache() {
        // Cache<char, String>
        let cache = CacheBuilder::new().build();
        let policy = cache.policy();

        assert_eq!(policy.strength(), Strength::Soft);
        assert_eq!(policy.pressure_capacity(), None);
        assert_eq!(policy.time_to_live(), None);
        assert_eq!(policy.time_to_idle(), None);
        assert!(policy.num_shards().is_power_of_two());

        cache.insert('a', "Alice");
        assert_eq!(cache.get(&'a').and_then(|v| v.value().copied()), Some("Alice"));

        let cache = CacheBuilder::new()
            .strength(Strength::Weak)
            .num_shards(5)
            .time_to_live(Duration::from_secs(45 * 60))
            .time_to_idle(Duration::from_secs(15 * 60))
            .build();
        let policy = cache.policy();

        assert_eq!(policy.strength(), Strength::Weak);
        assert_eq!(policy.time_to_live(), Some(Duration::from_secs(45 * 60)));
        assert_eq!(policy.time_to_idle(), Some(Duration::from_secs(15 * 60)));
        assert_eq!(policy.num_shards(), 8);

        let guard = cache.get_with('a', || Some("Alice"));
        assert_eq!(
            guard.as_ref().and_then(|v| v.value().copied()),
            Some("Alice")
        );
    }
}
