use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::{
    policy::Strength,
    value::{CacheValue, ValueBox, ValueRef},
};

/// Posted on the reclamation queue when the last strong reference to a value
/// box goes away. The `slot_id` lets the drain loop tell whether the entry
/// currently installed for `key` still owns the cleared slot, or the event is
/// stale because the entry was replaced in the meantime.
pub(crate) struct ReclaimEvent<K> {
    pub(crate) key: Arc<K>,
    pub(crate) slot_id: u64,
}

enum SlotState<K, V> {
    /// A stored "no value" marker. Nothing to reclaim, so it never registers
    /// with the queue.
    Negative,
    Present {
        value: Weak<ValueBox<K, V>>,
        /// The soft pin. `Strength::Soft` keeps the value alive through this
        /// hold until the pressure pass (or removal) releases it;
        /// `Strength::Weak` never sets it.
        pin: Mutex<Option<Arc<ValueBox<K, V>>>>,
    },
}

/// A single-value holder that owns its value only weakly.
///
/// The slot is created with a value (or the negative marker), hands out strong
/// `ValueRef` guards on `probe`, and reports `None` permanently once cleared.
/// A cleared slot is never resurrected; replacing a value installs a brand-new
/// slot with a fresh id.
pub(crate) struct ReclaimableSlot<K, V> {
    id: u64,
    state: SlotState<K, V>,
    is_cleared: AtomicBool,
}

impl<K, V> ReclaimableSlot<K, V> {
    /// Creates a slot holding the negative marker.
    pub(crate) fn negative(id: u64) -> Self {
        Self {
            id,
            state: SlotState::Negative,
            is_cleared: AtomicBool::new(false),
        }
    }

    /// Creates a slot holding `value` and returns the guard that currently
    /// keeps the value alive.
    ///
    /// For `Strength::Soft` the slot also pins the value. For
    /// `Strength::Weak` the returned guard is the only strong reference;
    /// dropping it reclaims the value.
    pub(crate) fn with_value(
        id: u64,
        key: Arc<K>,
        value: V,
        strength: Strength,
        reclaim_tx: &Sender<ReclaimEvent<K>>,
    ) -> (Self, ValueRef<K, V>) {
        let boxed = Arc::new(ValueBox::new(key, id, reclaim_tx.clone(), value));
        let weak = Arc::downgrade(&boxed);
        let pin = match strength {
            Strength::Weak => None,
            Strength::Soft => Some(Arc::clone(&boxed)),
        };
        let slot = Self {
            id,
            state: SlotState::Present {
                value: weak,
                pin: Mutex::new(pin),
            },
            is_cleared: AtomicBool::new(false),
        };
        (slot, ValueRef::new(boxed))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current value if the slot has not been cleared.
    ///
    /// The strong reference is captured *before* the cleared flag is checked,
    /// so a reader can never observe a value that is concurrently being torn
    /// down: either the upgrade fails, or the guard returned here keeps the
    /// value alive for the caller.
    pub(crate) fn probe(&self) -> Option<CacheValue<K, V>> {
        match &self.state {
            SlotState::Negative => {
                if self.is_cleared.load(Ordering::Acquire) {
                    None
                } else {
                    Some(CacheValue::Negative)
                }
            }
            SlotState::Present { value, .. } => {
                // Capture the strong reference first.
                let boxed = value.upgrade()?;
                if self.is_cleared.load(Ordering::Acquire) {
                    // Cleared between the lookup and here. The slot must stay
                    // unreachable forever, so the captured guard is discarded.
                    return None;
                }
                Some(CacheValue::Value(ValueRef::new(boxed)))
            }
        }
    }

    pub(crate) fn is_pinned(&self) -> bool {
        match &self.state {
            SlotState::Negative => false,
            SlotState::Present { pin, .. } => pin.lock().is_some(),
        }
    }

    /// Releases the soft pin without clearing the slot. The value stays
    /// reachable through outstanding `ValueRef` guards, and is reclaimed when
    /// the last of them goes away.
    ///
    /// Returns `true` if there was a pin to release.
    pub(crate) fn release_pin(&self) -> bool {
        match &self.state {
            SlotState::Negative => false,
            SlotState::Present { pin, .. } => pin.lock().take().is_some(),
        }
    }

    /// Eagerly and permanently clears the slot, releasing the pin if one was
    /// held. Used on removal and replacement so the old value becomes
    /// reclaimable immediately instead of waiting for its guards to drop.
    ///
    /// Returns `true` if a pin was released.
    pub(crate) fn clear(&self) -> bool {
        self.is_cleared.store(true, Ordering::Release);
        self.release_pin()
    }

    /// Returns `true` if the value has been reclaimed or the slot was
    /// explicitly cleared.
    pub(crate) fn is_cleared(&self) -> bool {
        if self.is_cleared.load(Ordering::Acquire) {
            return true;
        }
        match &self.state {
            SlotState::Negative => false,
            SlotState::Present { value, .. } => value.strong_count() == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Strength;

    use crossbeam_channel::unbounded;

    #[test]
    fn probe_and_clear() {
        let (tx, rx) = unbounded();
        let key = Arc::new("k");
        let (slot, guard) = ReclaimableSlot::with_value(7, key, 42, Strength::Soft, &tx);

        assert_eq!(slot.probe().and_then(|v| v.value().copied()), Some(42));
        assert!(slot.is_pinned());

        // Explicit clear releases the pin and makes the slot permanently
        // unreachable, even while a guard is still outstanding.
        assert!(slot.clear());
        assert!(slot.probe().is_none());
        assert!(slot.is_cleared());
        assert_eq!(*guard, 42);

        // The reclamation event fires once the last guard is gone.
        assert!(rx.try_recv().is_err());
        drop(guard);
        let ev = rx.try_recv().expect("expected a reclaim event");
        assert_eq!(ev.slot_id, 7);
        assert_eq!(*ev.key, "k");
    }

    #[test]
    fn weak_slot_reclaims_on_last_guard_drop() {
        let (tx, rx) = unbounded();
        let key = Arc::new(1u32);
        let (slot, guard) = ReclaimableSlot::with_value(1, key, "v", Strength::Weak, &tx);

        assert!(!slot.is_pinned());
        let second = slot.probe().and_then(CacheValue::into_value_ref).unwrap();

        drop(guard);
        // Still alive through `second`.
        assert!(slot.probe().is_some());
        assert!(rx.try_recv().is_err());

        drop(second);
        assert!(slot.probe().is_none());
        assert!(slot.is_cleared());
        assert_eq!(rx.try_recv().map(|ev| ev.slot_id), Ok(1));
    }

    #[test]
    fn release_pin_keeps_guarded_value_alive() {
        let (tx, rx) = unbounded();
        let key = Arc::new("k");
        let (slot, guard) = ReclaimableSlot::with_value(3, key, 5, Strength::Soft, &tx);

        assert!(slot.release_pin());
        // Not cleared: the outstanding guard still reaches the value.
        assert_eq!(slot.probe().and_then(|v| v.value().copied()), Some(5));
        assert!(!slot.release_pin());

        drop(slot.probe());
        drop(guard);
        assert_eq!(rx.try_recv().map(|ev| ev.slot_id), Ok(3));
    }

    #[test]
    fn negative_slot_never_registers() {
        let slot: ReclaimableSlot<&str, u32> = ReclaimableSlot::negative(9);
        assert!(matches!(slot.probe(), Some(CacheValue::Negative)));
        assert!(!slot.is_pinned());
        assert!(!slot.is_cleared());

        assert!(!slot.clear());
        assert!(slot.probe().is_none());
        assert!(slot.is_cleared());
    }
}
