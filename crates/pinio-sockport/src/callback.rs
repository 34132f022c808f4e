//! Completion callbacks.

use crate::port::SocketPort;
use pinio_core::buffer::Chunk;
use pinio_core::entry::Action;
use pinio_core::error::OpError;
use pinio_core::ident::Ident;
use std::net::SocketAddr;

/// Receives completed operations for the sockets it was registered with.
///
/// **Contract:**
/// - Called on a dispatch thread borrowed from the thread pool, never on
///   the event thread, and never with a socket port lock held. Calling
///   back into the [`SocketPort`] is allowed.
/// - Every `send`/`recv`/`connect` and every pooled accept produces
///   exactly one callback: the matching success callback or `on_error`.
/// - Chunks travel with the callback; dropping one recycles it.
/// - Panics are caught and logged.
pub trait SocketCallback: Send + Sync {
    fn on_connect(&self, port: &SocketPort, ident: Ident, peer: SocketAddr, userdata: u64);

    /// `bytes` of the submitted span were written.
    fn on_send(&self, port: &SocketPort, ident: Ident, chunk: Chunk, bytes: usize, userdata: u64);

    /// `bytes` were received and committed to `chunk` (they are the tail
    /// of `chunk.filled()`). `from` is set for datagrams.
    fn on_receive(
        &self,
        port: &SocketPort,
        ident: Ident,
        chunk: Chunk,
        bytes: usize,
        from: Option<SocketAddr>,
        userdata: u64,
    );

    /// `accepted` is a new, registered socket using this same callback.
    fn on_accept(
        &self,
        port: &SocketPort,
        listener: Ident,
        accepted: Ident,
        peer: SocketAddr,
        userdata: u64,
    );

    /// The operation failed, timed out or was cancelled. A send or
    /// receive buffer comes back in `chunk`.
    fn on_error(
        &self,
        port: &SocketPort,
        ident: Ident,
        action: Action,
        error: OpError,
        chunk: Option<Chunk>,
        userdata: u64,
    );
}
