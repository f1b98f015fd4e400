//! Monotonic time for the substrate
//!
//! All timestamps in the substrate are [`Time`] values: nanoseconds since
//! the owning clock's epoch. Durations use [`std::time::Duration`]. The
//! [`Clock`] anchors `Time` to a process-local monotonic instant so that
//! executors can convert scheduled deadlines back into sleepable instants.

use core::fmt;
use core::ops::{Add, Sub};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Monotonic timestamp in nanoseconds since the clock epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Time(pub u64);

impl Time {
    /// Zero time constant
    pub const ZERO: Self = Self(0);

    /// Create time from nanoseconds
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create time from microseconds
    pub const fn from_micros(us: u64) -> Self {
        Self(us * 1_000)
    }

    /// Create time from milliseconds
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms * 1_000_000)
    }

    /// Create time from seconds
    pub const fn from_secs(s: u64) -> Self {
        Self(s * 1_000_000_000)
    }

    /// Get nanoseconds since epoch
    pub const fn nanos(&self) -> u64 {
        self.0
    }

    /// Get milliseconds since epoch as a float
    pub fn as_millis_f32(&self) -> f32 {
        self.0 as f32 / 1_000_000.0
    }

    /// Get seconds since epoch as a float
    pub fn as_secs_f32(&self) -> f32 {
        self.0 as f32 / 1_000_000_000.0
    }

    /// Elapsed duration since an earlier time, zero if `earlier` is later
    pub fn since(&self, earlier: Time) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Signed difference `self - other` in milliseconds
    ///
    /// Positive when `self` is later than `other`.
    pub fn signed_diff_millis(&self, other: Time) -> f32 {
        (self.0 as i64 - other.0 as i64) as f32 / 1_000_000.0
    }

    /// Saturating addition of a duration
    pub fn saturating_add(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_nanos() as u64))
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.as_nanos() as u64)
    }
}

impl Sub<Time> for Time {
    type Output = Duration;

    fn sub(self, rhs: Time) -> Duration {
        self.since(rhs)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f32())
    }
}

/// Process-local monotonic clock mapping [`Time`] to [`Instant`]
///
/// Cheap to copy; every component of a substrate shares the clock created
/// by its matrix so that all timestamps are comparable.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Create a clock anchored at the current instant
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current substrate time
    pub fn now(&self) -> Time {
        Time(self.epoch.elapsed().as_nanos() as u64)
    }

    /// Convert a substrate time to a monotonic instant
    pub fn to_instant(&self, t: Time) -> Instant {
        self.epoch + Duration::from_nanos(t.nanos())
    }

    /// The clock's epoch instant
    pub fn epoch(&self) -> Instant {
        self.epoch
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_constructors() {
        assert_eq!(Time::from_millis(1).nanos(), 1_000_000);
        assert_eq!(Time::from_micros(1).nanos(), 1_000);
        assert_eq!(Time::from_secs(1).nanos(), 1_000_000_000);
        assert_eq!(Time::ZERO.nanos(), 0);
    }

    #[test]
    fn test_time_arithmetic() {
        let t = Time::from_millis(10) + Duration::from_millis(5);
        assert_eq!(t, Time::from_millis(15));

        let d = Time::from_millis(15) - Time::from_millis(10);
        assert_eq!(d, Duration::from_millis(5));

        // Subtraction saturates rather than panicking
        let d = Time::from_millis(10) - Time::from_millis(15);
        assert_eq!(d, Duration::ZERO);
    }

    #[test]
    fn test_signed_diff() {
        let a = Time::from_millis(20);
        let b = Time::from_millis(5);
        assert_eq!(a.signed_diff_millis(b), 15.0);
        assert_eq!(b.signed_diff_millis(a), -15.0);
    }

    #[test]
    fn test_clock_monotonic() {
        let clock = Clock::new();
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_clock_instant_roundtrip() {
        let clock = Clock::new();
        let t = Time::from_millis(100);
        let instant = clock.to_instant(t);
        assert_eq!(instant - clock.epoch(), Duration::from_millis(100));
    }
}
