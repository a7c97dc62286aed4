//! Time sources for time-dependent plugins
//!
//! Cache expiry and sliding-window accounting read the current time through
//! [`Clock`], so they can be driven deterministically with [`ManualClock`].

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Source of the current UTC time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Default clock used by plugins constructed without an explicit one
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to
///
/// ```rust
/// use chrono::TimeDelta;
/// use clickup_plugins::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::epoch();
/// let start = clock.now();
/// clock.advance(TimeDelta::seconds(61));
/// assert_eq!((clock.now() - start).num_seconds(), 61);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the Unix epoch
    pub fn epoch() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Move the clock forward (or backward, for a negative delta)
    pub fn advance(&self, delta: TimeDelta) {
        let mut current = self.current.lock();
        *current += delta;
    }

    /// Jump to an absolute instant
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.current.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::epoch();
        assert_eq!(clock.now(), DateTime::<Utc>::UNIX_EPOCH);

        clock.advance(TimeDelta::milliseconds(1500));
        assert_eq!(clock.now().timestamp_millis(), 1500);

        clock.set(DateTime::<Utc>::UNIX_EPOCH + TimeDelta::hours(1));
        assert_eq!(clock.now().timestamp(), 3600);
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = system_clock();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
