//! Socket port configuration.

use pinio_core::env::{env_get, env_get_ms};
use pinio_core::error::{Error, Result};
use pinio_cpe::CpeConfig;
use std::time::Duration;

pub mod defaults {
    /// Pool threads draining the completion port.
    pub const DISPATCH_THREADS: usize = 4;
    /// How long one `has_job` waits for a completion.
    pub const POLL_INTERVAL_MS: u64 = 20;
    /// Period of the timeout sweep.
    pub const SWEEP_INTERVAL_MS: u64 = 20;
    /// Outstanding accepts per listener.
    pub const ACCEPT_POOL: usize = 4;
    pub const BACKLOG: i32 = 128;
}

#[derive(Debug, Clone)]
pub struct SocketPortConfig {
    pub dispatch_threads: usize,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub accept_pool: usize,
    pub backlog: i32,
    pub cpe: CpeConfig,
}

impl Default for SocketPortConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SocketPortConfig {
    /// Defaults with environment overrides:
    /// - `PINIO_DISPATCH_THREADS`
    /// - `PINIO_POLL_INTERVAL_MS`
    /// - `PINIO_SWEEP_INTERVAL_MS`
    /// - `PINIO_ACCEPT_POOL`
    /// - `PINIO_BACKLOG`
    /// - plus everything `CpeConfig::from_env` reads
    pub fn from_env() -> Self {
        Self {
            dispatch_threads: env_get("PINIO_DISPATCH_THREADS", defaults::DISPATCH_THREADS),
            poll_interval: env_get_ms("PINIO_POLL_INTERVAL_MS", defaults::POLL_INTERVAL_MS),
            sweep_interval: env_get_ms("PINIO_SWEEP_INTERVAL_MS", defaults::SWEEP_INTERVAL_MS),
            accept_pool: env_get("PINIO_ACCEPT_POOL", defaults::ACCEPT_POOL),
            backlog: env_get("PINIO_BACKLOG", defaults::BACKLOG),
            cpe: CpeConfig::from_env(),
        }
    }

    /// Explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            dispatch_threads: defaults::DISPATCH_THREADS,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            sweep_interval: Duration::from_millis(defaults::SWEEP_INTERVAL_MS),
            accept_pool: defaults::ACCEPT_POOL,
            backlog: defaults::BACKLOG,
            cpe: CpeConfig::new(),
        }
    }

    // Builder methods

    pub fn dispatch_threads(mut self, n: usize) -> Self {
        self.dispatch_threads = n;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn sweep_interval(mut self, d: Duration) -> Self {
        self.sweep_interval = d;
        self
    }

    pub fn accept_pool(mut self, n: usize) -> Self {
        self.accept_pool = n;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn cpe(mut self, cpe: CpeConfig) -> Self {
        self.cpe = cpe;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch_threads == 0 {
            return Err(Error::InvalidConfig("dispatch_threads must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll_interval must be > 0"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("sweep_interval must be > 0"));
        }
        if self.accept_pool == 0 {
            return Err(Error::InvalidConfig("accept_pool must be > 0"));
        }
        self.cpe.validate()
    }

    pub fn print(&self) {
        tracing::info!(
            dispatch_threads = self.dispatch_threads,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            accept_pool = self.accept_pool,
            backlog = self.backlog,
            events_capacity = self.cpe.events_capacity,
            "socket port config"
        );
    }
}
