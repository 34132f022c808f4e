//! Address resolution for listen/connect/bind.

use pinio_core::error::{Error, Result};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Resolve `address` (IP literal, `[v6]`, host name, or empty / `*` for
/// the IPv4 wildcard) and `port` to one socket address. Host names prefer
/// an IPv4 result.
///
/// Name lookups block the caller.
pub fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    let host = address.trim();
    let host = match host {
        "" | "*" => "0.0.0.0",
        h => h
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(h),
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::Resolve(format!("{}:{}", host, port)))?
        .collect();
    candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| Error::Resolve(format!("{}:{}", host, port)))
}
