//! Heartbeat bookkeeping
//!
//! The periodic scheduler ticks every 100 ms; every 300 ticks a ping
//! goes out and the watchdog checks how long the broker has been silent.
//! The watchdog only arms once a first pong has been seen, so a broker
//! that never answers does not reset the device before login completes.

/// Scheduler tick period in milliseconds
pub const TICK_MILLIS: u64 = 100;

/// Ticks between pings (30 s at the 100 ms tick)
pub const PING_INTERVAL_TICKS: u32 = 300;

/// Seconds of pong silence after which the session is dead
pub const PONG_TIMEOUT_SECS: i64 = 40;

/// Heartbeat state shared between the tick path and the dispatch path
#[derive(Debug)]
pub struct Heartbeat {
    interval_ticks: u32,
    timeout_secs: i64,
    tick_count: u32,
    last_pong: Option<i64>,
}

impl Heartbeat {
    pub fn new(interval_ticks: u32, timeout_secs: i64) -> Self {
        Self {
            interval_ticks,
            timeout_secs,
            tick_count: 0,
            last_pong: None,
        }
    }

    /// Record a pong at `now`
    pub fn record_pong(&mut self, now: i64) {
        self.last_pong = Some(now);
    }

    pub fn last_pong(&self) -> Option<i64> {
        self.last_pong
    }

    /// Advance one tick; true when a ping is due
    pub fn on_tick(&mut self) -> bool {
        self.tick_count += 1;
        if self.tick_count >= self.interval_ticks {
            self.tick_count = 0;
            true
        } else {
            false
        }
    }

    /// Whether the watchdog window has elapsed since the last pong
    pub fn expired(&self, now: i64) -> bool {
        match self.last_pong {
            Some(at) => now - at > self.timeout_secs,
            None => false,
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(PING_INTERVAL_TICKS, PONG_TIMEOUT_SECS)
    }
}
