use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    common::time::{AtomicDuration, AtomicInstant, Instant},
    policy::EntryExpiration,
    slot::ReclaimableSlot,
};

/// The cache's record for one key: the value slot plus expiration metadata.
///
/// An entry is immutable in its key and slot; timestamps and per-entry
/// expiration overrides are atomic cells because reads, writes and the drain
/// loop touch them concurrently. An entry is never reused: replacement
/// installs a brand-new entry with a brand-new slot.
pub(crate) struct CacheEntry<K, V> {
    key: Arc<K>,
    slot: ReclaimableSlot<K, V>,
    last_modified: AtomicInstant,
    last_accessed: AtomicInstant,
    /// Per-entry time-to-live override. Unset means the cache default applies.
    ttl_override: AtomicDuration,
    /// Per-entry time-to-idle override. Unset means the cache default applies.
    tti_override: AtomicDuration,
    /// Latch ensuring the removal listener fires at most once per entry, no
    /// matter which of the racing removal paths wins.
    is_notified: AtomicBool,
}

impl<K, V> CacheEntry<K, V> {
    pub(crate) fn new(
        key: Arc<K>,
        slot: ReclaimableSlot<K, V>,
        now: Instant,
        expiration: Option<EntryExpiration>,
    ) -> Self {
        let expiration = expiration.unwrap_or_default();
        Self {
            key,
            slot,
            last_modified: AtomicInstant::new(now),
            last_accessed: AtomicInstant::new(now),
            ttl_override: AtomicDuration::new(expiration.ttl()),
            tti_override: AtomicDuration::new(expiration.tti()),
            is_notified: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &Arc<K> {
        &self.key
    }

    pub(crate) fn slot(&self) -> &ReclaimableSlot<K, V> {
        &self.slot
    }

    pub(crate) fn last_accessed(&self) -> Option<Instant> {
        self.last_accessed.instant()
    }

    pub(crate) fn set_last_accessed(&self, now: Instant) {
        self.last_accessed.set_instant(now);
    }

    /// Replaces the expiration overrides and resets the entry's timestamps,
    /// re-arming both expiry clocks from `now`.
    pub(crate) fn rearm(&self, now: Instant, expiration: EntryExpiration) {
        self.ttl_override.set_duration(expiration.ttl());
        self.tti_override.set_duration(expiration.tti());
        self.last_modified.set_instant(now);
        self.last_accessed.set_instant(now);
    }

    /// Returns `true` if the entry is logically expired at `now` under its own
    /// overrides, falling back to the cache-wide defaults for unset axes.
    ///
    /// Expiry and reclamation are independent; a pinned, perfectly reachable
    /// value can still be expired.
    pub(crate) fn is_expired(
        &self,
        default_ttl: Option<Duration>,
        default_tti: Option<Duration>,
        now: Instant,
    ) -> bool {
        if let (Some(ttl), Some(written)) = (
            self.ttl_override.duration().or(default_ttl),
            self.last_modified.instant(),
        ) {
            if written.saturating_add(ttl) <= now {
                return true;
            }
        }
        if let (Some(tti), Some(accessed)) = (
            self.tti_override.duration().or(default_tti),
            self.last_accessed.instant(),
        ) {
            if accessed.saturating_add(tti) <= now {
                return true;
            }
        }
        false
    }

    /// Claims the right to fire this entry's removal notification. Only the
    /// first caller over the entry's lifetime gets `true`.
    pub(crate) fn begin_notify(&self) -> bool {
        self.is_notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
