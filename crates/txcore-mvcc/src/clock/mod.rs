//! Logical commit clock.
//!
//! A single monotonic counter orders every commit and every snapshot in the
//! core. Commits advance it with [`LogicalClock::tick`]; snapshots read it
//! with [`LogicalClock::read`].
//!
//! # Algorithm
//!
//! On commit:
//! 1. c = c + 1
//! 2. stamp the committed versions with c
//!
//! On snapshot:
//! 1. s = c
//! 2. every version stamped with a value <= s is visible
//!
//! After recovery the clock is moved past every recovered commit with
//! [`LogicalClock::advance_to`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use txcore_common::types::Timestamp;

/// A monotonic logical clock.
///
/// Thread-safe; every operation is a single atomic instruction.
pub struct LogicalClock {
    /// Last issued timestamp.
    current: AtomicU64,
}

impl LogicalClock {
    /// Creates a clock whose first tick returns 1.
    pub fn new() -> Self {
        Self::starting_at(Timestamp::ZERO)
    }

    /// Creates a clock that has already issued `ts`.
    pub fn starting_at(ts: Timestamp) -> Self {
        Self {
            current: AtomicU64::new(ts.as_u64()),
        }
    }

    /// Returns the last issued timestamp without advancing the clock.
    #[inline]
    pub fn read(&self) -> Timestamp {
        Timestamp::new(self.current.load(AtomicOrdering::Acquire))
    }

    /// Advances the clock and returns the new timestamp.
    #[inline]
    pub fn tick(&self) -> Timestamp {
        Timestamp::new(self.current.fetch_add(1, AtomicOrdering::AcqRel) + 1)
    }

    /// Moves the clock forward to at least `ts`. Never moves it backwards.
    pub fn advance_to(&self, ts: Timestamp) -> Timestamp {
        let prev = self.current.fetch_max(ts.as_u64(), AtomicOrdering::AcqRel);
        Timestamp::new(prev.max(ts.as_u64()))
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalClock")
            .field("current", &self.current.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_tick_is_monotonic() {
        let clock = LogicalClock::new();
        assert_eq!(clock.read(), Timestamp::ZERO);
        let t1 = clock.tick();
        let t2 = clock.tick();
        assert!(t1 < t2);
        assert_eq!(clock.read(), t2);
    }

    #[test]
    fn test_advance_to_never_goes_back() {
        let clock = LogicalClock::starting_at(Timestamp::new(10));
        assert_eq!(clock.advance_to(Timestamp::new(5)), Timestamp::new(10));
        assert_eq!(clock.advance_to(Timestamp::new(20)), Timestamp::new(20));
        assert_eq!(clock.tick(), Timestamp::new(21));
    }

    #[test]
    fn test_concurrent_ticks_are_unique() {
        let clock = Arc::new(LogicalClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || (0..1000).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
