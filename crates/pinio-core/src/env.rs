//! Environment variable helpers for `PINIO_*` configuration.
//!
//! # Usage
//!
//! ```ignore
//! use pinio_core::env::{env_get, env_get_ms, env_get_timeout};
//!
//! let threads: usize = env_get("PINIO_DISPATCH_THREADS", 4);
//! let sweep = env_get_ms("PINIO_SWEEP_INTERVAL_MS", 25);
//! // 0 means "no timeout"
//! let recv_timeout = env_get_timeout("PINIO_RECV_TIMEOUT_MS", 0);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Milliseconds as a `Duration`.
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Milliseconds as an optional timeout; 0 means none.
#[inline]
pub fn env_get_timeout(key: &str, default_ms: u64) -> Option<Duration> {
    match env_get(key, default_ms) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}
