use std::{
    fmt::Debug,
    ops::Deref,
    sync::Arc,
};

use crossbeam_channel::Sender;

use crate::slot::ReclaimEvent;

/// The shared box a cached value lives in.
///
/// The cache itself only holds a `Weak` to the box; strong references are the
/// `ValueRef` guards handed to readers, plus the slot's own pin when the cache
/// uses `Strength::Soft`. When the last strong reference goes away, the `Drop`
/// impl posts a `ReclaimEvent` on the cache's reclamation queue so a later
/// maintenance pass can purge the owning entry.
pub(crate) struct ValueBox<K, V> {
    key: Arc<K>,
    slot_id: u64,
    reclaim_tx: Sender<ReclaimEvent<K>>,
    value: V,
}

impl<K, V> ValueBox<K, V> {
    pub(crate) fn new(
        key: Arc<K>,
        slot_id: u64,
        reclaim_tx: Sender<ReclaimEvent<K>>,
        value: V,
    ) -> Self {
        Self {
            key,
            slot_id,
            reclaim_tx,
            value,
        }
    }
}

impl<K, V> Drop for ValueBox<K, V> {
    fn drop(&mut self) {
        // The receiver side is gone when the cache itself has been dropped;
        // nothing is left to purge then.
        let _ = self.reclaim_tx.send(ReclaimEvent {
            key: Arc::clone(&self.key),
            slot_id: self.slot_id,
        });
    }
}

/// A strong read guard for a cached value.
///
/// The value stays alive (and the entry stays unreclaimed) at least as long as
/// one `ValueRef` for it exists. Dereferences to `V`.
pub struct ValueRef<K, V> {
    inner: Arc<ValueBox<K, V>>,
}

impl<K, V> ValueRef<K, V> {
    pub(crate) fn new(inner: Arc<ValueBox<K, V>>) -> Self {
        Self { inner }
    }

    /// Returns a reference to the key of the entry this value was read from.
    pub fn key(&self) -> &K {
        &self.inner.key
    }
}

impl<K, V> Clone for ValueRef<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Deref for ValueRef<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner.value
    }
}

impl<K, V> Debug for ValueRef<K, V>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueRef")
            .field("key", self.key())
            .field("value", &self.inner.value)
            .finish()
    }
}

/// A value read from the cache.
///
/// Distinguishes a stored "no value" marker (negative caching) from an actual
/// value; an absent key is the `None` of the surrounding `Option` instead.
#[derive(Debug)]
pub enum CacheValue<K, V> {
    /// The entry is present but was stored without a value
    /// ([`Cache::insert_negative`][insert-negative]).
    ///
    /// [insert-negative]: ./struct.Cache.html#method.insert_negative
    Negative,
    /// The entry's value, kept alive by this guard.
    Value(ValueRef<K, V>),
}

impl<K, V> CacheValue<K, V> {
    /// Returns a reference to the value, or `None` for a negative entry.
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Negative => None,
            Self::Value(v) => Some(v),
        }
    }

    /// Returns `true` if this is a stored "no value" marker.
    pub fn is_negative(&self) -> bool {
        matches!(self, Self::Negative)
    }

    /// Returns the value guard, or `None` for a negative entry.
    pub fn into_value_ref(self) -> Option<ValueRef<K, V>> {
        match self {
            Self::Negative => None,
            Self::Value(v) => Some(v),
        }
    }
}

impl<K, V> Clone for CacheValue<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Negative => Self::Negative,
            Self::Value(v) => Self::Value(v.clone()),
        }
    }
}
