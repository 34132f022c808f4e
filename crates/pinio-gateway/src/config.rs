//! Gateway configuration.

use pinio_core::buffer::CHUNK_SIZE;
use pinio_core::env::{env_get, env_get_ms, env_get_timeout};
use pinio_core::error::{Error, Result};
use pinio_sockport::SocketPortConfig;
use std::time::Duration;

pub mod defaults {
    /// Shared by chunk pages and pin records.
    pub const MEMORY_BUDGET: usize = 16 * 1024 * 1024;
    /// Idle pages kept for reuse.
    pub const CHUNK_CACHE: usize = 64;
    pub const HOUSEKEEPING_IDLE_MS: u64 = 100;
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 2000;
    /// 0 = no timeout.
    pub const SEND_TIMEOUT_MS: u64 = 0;
    pub const RECV_TIMEOUT_MS: u64 = 0;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub memory_budget: usize,
    pub chunk_cache: usize,
    /// Housekeeping thread sleep between checks when not woken.
    pub housekeeping_idle: Duration,
    /// How long `shutdown` waits for pins to finish closing.
    pub shutdown_timeout: Duration,
    /// Default per-pin timeouts; `None` waits forever.
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub sockport: SocketPortConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl GatewayConfig {
    /// Defaults with environment overrides:
    /// - `PINIO_MEMORY_BUDGET` (bytes)
    /// - `PINIO_CHUNK_CACHE`
    /// - `PINIO_HOUSEKEEPING_IDLE_MS`
    /// - `PINIO_SHUTDOWN_TIMEOUT_MS`
    /// - `PINIO_SEND_TIMEOUT_MS`, `PINIO_RECV_TIMEOUT_MS` (0 = none)
    /// - plus everything `SocketPortConfig::from_env` reads
    pub fn from_env() -> Self {
        Self {
            memory_budget: env_get("PINIO_MEMORY_BUDGET", defaults::MEMORY_BUDGET),
            chunk_cache: env_get("PINIO_CHUNK_CACHE", defaults::CHUNK_CACHE),
            housekeeping_idle: env_get_ms(
                "PINIO_HOUSEKEEPING_IDLE_MS",
                defaults::HOUSEKEEPING_IDLE_MS,
            ),
            shutdown_timeout: env_get_ms("PINIO_SHUTDOWN_TIMEOUT_MS", defaults::SHUTDOWN_TIMEOUT_MS),
            send_timeout: env_get_timeout("PINIO_SEND_TIMEOUT_MS", defaults::SEND_TIMEOUT_MS),
            recv_timeout: env_get_timeout("PINIO_RECV_TIMEOUT_MS", defaults::RECV_TIMEOUT_MS),
            sockport: SocketPortConfig::from_env(),
        }
    }

    /// Explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            memory_budget: defaults::MEMORY_BUDGET,
            chunk_cache: defaults::CHUNK_CACHE,
            housekeeping_idle: Duration::from_millis(defaults::HOUSEKEEPING_IDLE_MS),
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            send_timeout: None,
            recv_timeout: None,
            sockport: SocketPortConfig::new(),
        }
    }

    // Builder methods

    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn chunk_cache(mut self, pages: usize) -> Self {
        self.chunk_cache = pages;
        self
    }

    pub fn housekeeping_idle(mut self, d: Duration) -> Self {
        self.housekeeping_idle = d;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn send_timeout(mut self, t: Option<Duration>) -> Self {
        self.send_timeout = t;
        self
    }

    pub fn recv_timeout(mut self, t: Option<Duration>) -> Self {
        self.recv_timeout = t;
        self
    }

    pub fn sockport(mut self, sockport: SocketPortConfig) -> Self {
        self.sockport = sockport;
        self
    }

    /// Pool threads a gateway borrows: dispatch plus housekeeping.
    pub fn threads_needed(&self) -> usize {
        self.sockport.dispatch_threads + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_budget < CHUNK_SIZE {
            return Err(Error::InvalidConfig("memory_budget must hold at least one chunk"));
        }
        if self.housekeeping_idle.is_zero() {
            return Err(Error::InvalidConfig("housekeeping_idle must be > 0"));
        }
        self.sockport.validate()
    }

    pub fn print(&self) {
        tracing::info!(
            memory_budget = self.memory_budget,
            chunk_cache = self.chunk_cache,
            housekeeping_idle_ms = self.housekeeping_idle.as_millis() as u64,
            shutdown_timeout_ms = self.shutdown_timeout.as_millis() as u64,
            send_timeout = ?self.send_timeout,
            recv_timeout = ?self.recv_timeout,
            "gateway config"
        );
        self.sockport.print();
    }
}
