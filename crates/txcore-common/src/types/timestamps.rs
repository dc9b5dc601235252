//! Timestamp types for txcore.
//!
//! Two notions of time are used across the core:
//!
//! - [`Timestamp`]: a logical clock value. Snapshots read it, commits advance
//!   it. Ordering between logical timestamps is what defines visibility.
//! - [`WallTime`]: wall-clock time, only used for reporting (transaction
//!   start times, deadlock events, vacuum runs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A logical timestamp drawn from the commit clock.
///
/// Commit timestamps and snapshot timestamps come from the same clock. A
/// version created by a commit with timestamp `c` is visible to a snapshot
/// taken at `s` iff `c <= s`.
///
/// # Example
///
/// ```rust
/// use txcore_common::types::Timestamp;
///
/// let ts = Timestamp::new(5);
/// assert!(ts.next() > ts);
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Zero timestamp, older than every commit.
    pub const ZERO: Self = Self(0);

    /// Maximum timestamp value.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a timestamp from a raw clock value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw clock value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following timestamp.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

/// Wall-clock instant used in status output.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct WallTime(DateTime<Utc>);

impl WallTime {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn as_millis(self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Time elapsed since this instant, zero if the clock went backwards.
    #[must_use]
    pub fn elapsed(self) -> Duration {
        (Utc::now() - self.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns the inner `chrono` value.
    #[must_use]
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Debug for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WallTime({})", self.0.to_rfc3339())
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

impl From<DateTime<Utc>> for WallTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp() {
        let ts = Timestamp::new(10);
        assert_eq!(ts.as_u64(), 10);
        assert_eq!(ts.next(), Timestamp::new(11));
        assert_eq!(Timestamp::MAX.next(), Timestamp::MAX);
        assert!(Timestamp::ZERO < ts);
    }

    #[test]
    fn test_wall_time() {
        let t = WallTime::now();
        assert!(t.as_millis() > 0);
        assert!(t.elapsed() < Duration::from_secs(60));
        assert!(t.to_string().ends_with('Z'));
    }
}
