use std::time::Instant as StdInstant;

#[cfg(test)]
use std::{sync::Arc, time::Duration};

#[cfg(test)]
use parking_lot::RwLock;

// This is `refcache`'s `Instant` struct.
use super::Instant;

#[derive(Default, Clone)]
pub(crate) struct Clock {
    ty: ClockType,
}

#[derive(Clone)]
enum ClockType {
    /// A clock that uses `std::time::Instant` as the source of time.
    Standard { origin: StdInstant },
    #[cfg(feature = "quanta")]
    /// A clock that uses `quanta::Instant` as the source of time. Depending on
    /// the CPU architecture, it can be faster to read than the standard one.
    Quanta { origin: quanta::Instant },
    #[cfg(test)]
    /// A clock that uses a mocked source of time.
    Mocked { mock: Arc<Mock> },
}

impl Default for ClockType {
    /// Create a new `ClockType` with the current time as the origin.
    ///
    /// If the `quanta` feature is enabled, `Quanta` will be used. Otherwise,
    /// `Standard` will be used.
    fn default() -> Self {
        #[cfg(feature = "quanta")]
        {
            return ClockType::Quanta {
                origin: quanta::Instant::now(),
            };
        }

        #[allow(unreachable_code)]
        ClockType::Standard {
            origin: StdInstant::now(),
        }
    }
}

impl Clock {
    #[cfg(test)]
    /// Creates a new `Clock` with a mocked source of time.
    pub(crate) fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    /// Returns the time elapsed since this `Clock` was created.
    ///
    /// When the type is `Mocked`, the time is based on the mocked source of
    /// time and only advances when `Mock::increment` is called.
    pub(crate) fn now(&self) -> Instant {
        match &self.ty {
            ClockType::Standard { origin } => {
                Instant::from_duration_since_clock_start(origin.elapsed())
            }
            #[cfg(feature = "quanta")]
            ClockType::Quanta { origin } => {
                Instant::from_duration_since_clock_start(origin.elapsed())
            }
            #[cfg(test)]
            ClockType::Mocked { mock } => Instant::from_duration_since_clock_start(mock.elapsed()),
        }
    }
}

#[cfg(test)]
pub(crate) struct Mock {
    origin: StdInstant,
    now: RwLock<StdInstant>,
}

#[cfg(test)]
impl Default for Mock {
    fn default() -> Self {
        let origin = StdInstant::now();
        Self {
            origin,
            now: RwLock::new(origin),
        }
    }
}

#[cfg(test)]
impl Mock {
    pub(crate) fn increment(&self, amount: Duration) {
        *self.now.write() += amount;
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.now.read().duration_since(self.origin)
    }
}
