use std::time::Duration;

/// The reference strength a cache keeps on its stored values.
///
/// Values are stored behind a reclaimable slot: the cache itself only holds a
/// weak reference, and readers receive strong [`ValueRef`][value-ref] guards.
/// The strength decides whether the slot additionally pins the value with a
/// strong hold of its own.
///
/// [value-ref]: ./struct.ValueRef.html
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strength {
    /// The slot takes no strong hold. A value lives exactly as long as some
    /// caller holds a `ValueRef` to it; once the last guard is dropped the
    /// value is reclaimed and the entry is purged on a later maintenance pass.
    ///
    /// An `insert` into a weak cache stores a value nobody holds a guard for,
    /// so it becomes reclaimable immediately. Weak caches are populated
    /// through `get_with`, which returns the guard that keeps the value alive.
    Weak,
    /// The slot pins the value with a strong hold. The pin is released when
    /// the number of pinned values exceeds the cache's `pressure_capacity`
    /// (oldest access first), after which the slot behaves like `Weak`.
    ///
    /// Without a `pressure_capacity` the pin is only released by removal or
    /// replacement.
    Soft,
}

impl Default for Strength {
    fn default() -> Self {
        Self::Soft
    }
}

/// Per-entry expiration overrides, applied by
/// [`Cache::insert_with_expiration`][insert-we] and
/// [`Cache::set_expiration`][set-exp].
///
/// An unset axis means the entry inherits the cache-wide default for that
/// axis. Use `Duration::MAX` to make an axis never expire even when the cache
/// has a default.
///
/// [insert-we]: ./struct.Cache.html#method.insert_with_expiration
/// [set-exp]: ./struct.Cache.html#method.set_expiration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryExpiration {
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
}

impl EntryExpiration {
    /// Creates an `EntryExpiration` with both axes unset (inherit the cache
    /// defaults).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the time to live: the entry expires after the given duration past
    /// the last write.
    pub fn time_to_live(self, duration: Duration) -> Self {
        Self {
            time_to_live: Some(duration),
            ..self
        }
    }

    /// Sets the time to idle: the entry expires after the given duration past
    /// the last read or write.
    pub fn time_to_idle(self, duration: Duration) -> Self {
        Self {
            time_to_idle: Some(duration),
            ..self
        }
    }

    pub(crate) fn ttl(&self) -> Option<Duration> {
        self.time_to_live
    }

    pub(crate) fn tti(&self) -> Option<Duration> {
        self.time_to_idle
    }

    pub(crate) fn is_unset(&self) -> bool {
        self.time_to_live.is_none() && self.time_to_idle.is_none()
    }
}

/// The configuration of a cache, readable through
/// [`Cache::policy`][cache-policy].
///
/// [cache-policy]: ./struct.Cache.html#method.policy
#[derive(Clone, Debug)]
pub struct Policy {
    strength: Strength,
    pressure_capacity: Option<usize>,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    num_shards: usize,
}

impl Policy {
    pub(crate) fn new(
        strength: Strength,
        pressure_capacity: Option<usize>,
        time_to_live: Option<Duration>,
        time_to_idle: Option<Duration>,
        num_shards: usize,
    ) -> Self {
        Self {
            strength,
            pressure_capacity,
            time_to_live,
            time_to_idle,
            num_shards,
        }
    }

    /// Returns the reference strength of this cache.
    pub fn strength(&self) -> Strength {
        self.strength
    }

    /// Returns the number of pinned values above which soft pins are released,
    /// if one was configured.
    pub fn pressure_capacity(&self) -> Option<usize> {
        self.pressure_capacity
    }

    /// Returns the default time to live of this cache.
    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    /// Returns the default time to idle of this cache.
    pub fn time_to_idle(&self) -> Option<Duration> {
        self.time_to_idle
    }

    /// Returns the number of shards of this cache's hash table.
    pub fn num_shards(&self) -> usize {
        self.num_shards
    }
}
