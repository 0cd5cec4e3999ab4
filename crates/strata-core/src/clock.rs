//! Wall-clock access.
//!
//! The orchestrator decides whether to move to a finer resolution by comparing the
//! next expected diff timestamp against "now"; taking the clock as a trait keeps
//! that decision testable.

use std::fmt;

use chrono::{DateTime, Utc};

/// Source of the current UTC time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_does_not_move() {
        let clock = FixedClock(DateTime::UNIX_EPOCH);
        assert_eq!(clock.now(), clock.now());
        assert!(SystemClock.now() > clock.now());
    }
}
