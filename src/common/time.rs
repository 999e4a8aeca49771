pub(crate) mod atomic_time;
pub(crate) mod clock;
pub(crate) mod instant;

pub(crate) use atomic_time::{AtomicDuration, AtomicInstant};
pub(crate) use clock::Clock;
pub(crate) use instant::Instant;
