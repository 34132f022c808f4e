//! Completion port configuration.

use pinio_core::env::{env_get, env_get_ms};
use pinio_core::error::{Error, Result};
use std::time::Duration;

pub mod defaults {
    /// mio events drained per poll.
    pub const EVENTS_CAPACITY: usize = 1024;
    /// Upper bound on one poll wait; the event thread re-checks for
    /// shutdown at least this often.
    pub const POLL_TICK_MS: u64 = 100;
}

#[derive(Debug, Clone)]
pub struct CpeConfig {
    pub events_capacity: usize,
    pub poll_tick: Duration,
}

impl Default for CpeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl CpeConfig {
    /// Defaults with environment overrides:
    /// - `PINIO_EVENTS_CAPACITY`
    /// - `PINIO_POLL_TICK_MS`
    pub fn from_env() -> Self {
        Self {
            events_capacity: env_get("PINIO_EVENTS_CAPACITY", defaults::EVENTS_CAPACITY),
            poll_tick: env_get_ms("PINIO_POLL_TICK_MS", defaults::POLL_TICK_MS),
        }
    }

    /// Explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            events_capacity: defaults::EVENTS_CAPACITY,
            poll_tick: Duration::from_millis(defaults::POLL_TICK_MS),
        }
    }

    pub fn events_capacity(mut self, n: usize) -> Self {
        self.events_capacity = n;
        self
    }

    pub fn poll_tick(mut self, d: Duration) -> Self {
        self.poll_tick = d;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.events_capacity == 0 {
            return Err(Error::InvalidConfig("events_capacity must be > 0"));
        }
        if self.poll_tick.is_zero() {
            return Err(Error::InvalidConfig("poll_tick must be > 0"));
        }
        Ok(())
    }
}
