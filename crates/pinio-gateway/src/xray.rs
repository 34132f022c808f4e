//! Diagnostics snapshot.

use std::fmt;

/// Point-in-time view of a gateway, from [`Gateway::doxray`].
///
/// [`Gateway::doxray`]: crate::Gateway::doxray
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XRay {
    pub live: usize,
    pub closing_deferred: usize,
    pub pending_close: usize,
    pub destroyed: u64,
    pub listeners: usize,
    /// Sockets known to the socket port (pins, listeners, closing).
    pub sockets: usize,
    /// Unsent bytes across all outbound chains.
    pub outbound_bytes: usize,
    pub chunks_in_use: usize,
    pub chunks_cached: usize,
    pub memory_in_use: usize,
    pub memory_budget: usize,
    pub threads_total: usize,
    pub threads_borrowed: usize,
}

impl XRay {
    /// Pins not yet destroyed.
    pub fn pins(&self) -> usize {
        self.live + self.closing_deferred + self.pending_close
    }
}

impl fmt::Display for XRay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Gateway XRay ===")?;
        writeln!(
            f,
            "pins:      {} live, {} closing, {} pending close, {} destroyed",
            self.live, self.closing_deferred, self.pending_close, self.destroyed
        )?;
        writeln!(f, "listeners: {}   sockets: {}", self.listeners, self.sockets)?;
        writeln!(
            f,
            "chunks:    {} in use, {} cached, {} bytes unsent",
            self.chunks_in_use, self.chunks_cached, self.outbound_bytes
        )?;
        writeln!(
            f,
            "memory:    {} / {} bytes ({:.1}%)",
            self.memory_in_use,
            self.memory_budget,
            if self.memory_budget == 0 {
                0.0
            } else {
                self.memory_in_use as f64 * 100.0 / self.memory_budget as f64
            }
        )?;
        write!(
            f,
            "threads:   {} / {} borrowed",
            self.threads_borrowed, self.threads_total
        )
    }
}
