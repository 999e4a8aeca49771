use super::instant::saturating_nanos;
use crate::common::time::Instant;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// `AtomicInstant` is a wrapper around `AtomicU64` that provides thread-safe
/// access to an `Instant`.
///
/// `u64::MAX` is used to represent an unset `Instant`.
#[derive(Debug)]
pub(crate) struct AtomicInstant {
    instant: AtomicU64,
}

impl AtomicInstant {
    /// Creates a new `AtomicInstant` with the given `Instant`.
    pub(crate) fn new(instant: Instant) -> Self {
        // Ensure the `Instant` is not `u64::MAX`, which means unset.
        debug_assert!(instant.as_nanos() != u64::MAX);

        Self {
            instant: AtomicU64::new(instant.as_nanos()),
        }
    }

    /// Returns the `Instant` if it is set, otherwise `None`.
    pub(crate) fn instant(&self) -> Option<Instant> {
        let ts = self.instant.load(Ordering::Acquire);
        if ts == u64::MAX {
            None
        } else {
            Some(Instant::from_nanos(ts))
        }
    }

    /// Sets the `Instant`.
    pub(crate) fn set_instant(&self, instant: Instant) {
        // Ensure the `Instant` is not `u64::MAX`, which means unset.
        debug_assert!(instant.as_nanos() != u64::MAX);

        self.instant.store(instant.as_nanos(), Ordering::Release);
    }
}

/// `AtomicDuration` is a wrapper around `AtomicU64` that provides thread-safe
/// access to an optional `Duration` with nanosecond precision.
///
/// `u64::MAX` is used to represent an unset `Duration`. A set cell saturates at
/// `u64::MAX - 1` nanoseconds, which is far enough in the future to mean
/// "never".
#[derive(Debug)]
pub(crate) struct AtomicDuration {
    nanos: AtomicU64,
}

impl Default for AtomicDuration {
    /// Creates a new `AtomicDuration` with an unset `Duration`.
    fn default() -> Self {
        Self {
            nanos: AtomicU64::new(u64::MAX),
        }
    }
}

impl AtomicDuration {
    pub(crate) fn new(duration: Option<Duration>) -> Self {
        let this = Self::default();
        this.set_duration(duration);
        this
    }

    /// Returns the `Duration` if it is set, otherwise `None`.
    pub(crate) fn duration(&self) -> Option<Duration> {
        let nanos = self.nanos.load(Ordering::Acquire);
        if nanos == u64::MAX {
            None
        } else {
            Some(Duration::from_nanos(nanos))
        }
    }

    /// Sets or clears the `Duration`.
    pub(crate) fn set_duration(&self, duration: Option<Duration>) {
        let nanos = duration.map(saturating_nanos).unwrap_or(u64::MAX);
        self.nanos.store(nanos, Ordering::Release);
    }
}
