//! Injectable time source.
//!
//! Anything that stamps a wall-clock time onto persisted data takes an
//! `Arc<dyn Clock>` instead of calling `Utc::now()` directly, so tests can
//! pin the time without touching shared state.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Trait for providing the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock implementation that returns the real system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Returns a shareable system clock.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that always reports the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock {
    at: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.at
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn should_return_the_pinned_instant() {
        // given
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 8, 16, 13).unwrap();
        let clock = FixedClock::new(at);

        // when
        let first = clock.now();
        let second = clock.now();

        // then
        assert_eq!(first, at);
        assert_eq!(second, at);
    }

    #[test]
    fn should_advance_system_clock() {
        // given
        let clock = SystemClock::shared();

        // when
        let first = clock.now();
        let second = clock.now();

        // then
        assert!(second >= first);
    }
}
