//! Connectivity status indication
//!
//! The protocol core reports link health through a small sink interface;
//! on the original hardware this drives a status LED (off when
//! disconnected, solid when connected, fast blink while retrying a lost
//! link). The default implementation maps the same pattern onto log
//! output.

use tracing::{debug, info};

/// Link health as seen by the protocol core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// No broker connection
    Disconnected,
    /// Logged in and serving
    Connected,
    /// Link dropped, reconnect pending
    Lost,
}

/// Sink for connectivity transitions and the periodic tick that drives
/// the blink pattern
pub trait StatusSink: Send {
    fn set_state(&mut self, state: ConnectivityState);

    /// Called once per scheduler tick (100 ms)
    fn on_tick(&mut self);
}

/// Log-backed indicator reproducing the LED semantics
pub struct LogIndicator {
    state: ConnectivityState,
    tick: u32,
    lit: bool,
}

impl LogIndicator {
    pub fn new() -> Self {
        Self {
            state: ConnectivityState::Disconnected,
            tick: 0,
            lit: false,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }
}

impl Default for LogIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for LogIndicator {
    fn set_state(&mut self, state: ConnectivityState) {
        if state != self.state {
            info!(?state, "connectivity changed");
            self.state = state;
        }
    }

    fn on_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        // lost link: fast blink, toggling every second tick (0.2 s)
        if self.state == ConnectivityState::Lost && self.tick % 2 == 0 {
            self.lit = !self.lit;
            debug!(lit = self.lit, "link indicator blink");
        }
    }
}
