//! Time sources for token refill and idle-age checks.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic reading used for refill and eviction arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock seconds since the Unix epoch.
    fn unix_timestamp(&self) -> i64;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_timestamp(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
///
/// Both readings advance together, so a test can step through a scenario
/// second by second without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    unix_origin: i64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp())
    }

    /// Create a clock whose wall reading starts at `unix_origin`.
    pub fn starting_at(unix_origin: i64) -> Self {
        Self {
            origin: Instant::now(),
            unix_origin,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn unix_timestamp(&self) -> i64 {
        self.unix_origin + self.offset.lock().as_secs() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_starts_frozen() {
        let clock = ManualClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), a);
    }

    #[test]
    fn test_manual_clock_advances_both_readings() {
        let clock = ManualClock::starting_at(1_700_000_000);
        let start = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now() - start, Duration::from_secs(90));
        assert_eq!(clock.unix_timestamp(), 1_700_000_090);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(clock.unix_timestamp() > 0);
    }
}
