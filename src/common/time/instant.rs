use std::time::Duration;

pub(crate) const MAX_NANOS: u64 = u64::MAX - 1;

/// `Instant` represents a point in time since the `Clock` was created. It has
/// nanosecond precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Instant {
    elapsed_ns: u64,
}

impl Instant {
    pub(crate) fn from_nanos(nanos: u64) -> Instant {
        debug_assert!(nanos <= MAX_NANOS);
        Instant { elapsed_ns: nanos }
    }

    pub(crate) fn from_duration_since_clock_start(duration: Duration) -> Instant {
        Instant::from_nanos(saturating_nanos(duration))
    }

    pub(crate) fn as_nanos(&self) -> u64 {
        self.elapsed_ns
    }

    pub(crate) fn saturating_add(&self, duration: Duration) -> Instant {
        let dur_ns = saturating_nanos(duration);
        Instant::from_nanos(self.elapsed_ns.saturating_add(dur_ns).min(MAX_NANOS))
    }
}

/// Converts a `std::time::Duration` to nanoseconds, saturating to `MAX_NANOS`
/// (`u64::MAX - 1`) if the duration is too large. (`Duration::as_nanos` returns
/// `u128`)
///
/// Note that `u64::MAX - 1` is used here instead of `u64::MAX` because
/// `u64::MAX` is used by `AtomicInstant` and `AtomicDuration` to indicate an
/// unset cell.
pub(crate) fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos())
        .map(|n| n.min(MAX_NANOS))
        .unwrap_or(MAX_NANOS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_add() {
        let instant = Instant::from_nanos(100_000);
        let duration = Duration::from_nanos(50_000);
        assert_eq!(instant.saturating_add(duration), Instant::from_nanos(150_000));

        let instant = Instant::from_nanos(u64::MAX - 10_000);
        let duration = Duration::from_nanos(12_000);
        assert_eq!(instant.saturating_add(duration), Instant::from_nanos(u64::MAX - 1));

        // A `Duration::MAX` TTL saturates to an expiry point that can never be
        // reached.
        let instant = Instant::from_nanos(42);
        assert_eq!(
            instant.saturating_add(Duration::MAX),
            Instant::from_nanos(MAX_NANOS)
        );
    }

}
