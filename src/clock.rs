//! Time source abstraction
//!
//! The session needs wall-clock seconds for login timestamps and
//! heartbeat watchdog arithmetic; injecting the source keeps the
//! protocol engine deterministic under test.

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of unix time in whole seconds
pub trait Clock: Send {
    fn unix_now(&self) -> i64;
}

/// System wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let now = clock.unix_now();
        assert!(now > 1_500_000_000);
    }
}
