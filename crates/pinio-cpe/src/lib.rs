//! # pinio-cpe — Completion port emulation
//!
//! Windows-style completion ports on top of epoll/kqueue (via mio):
//!
//! 1. A socket is registered with a port under a completion key
//!    ([`CompletionPorts::create_port`]).
//! 2. Async operations ([`OpBlock`]) are initiated against the socket.
//!    At most one per (socket, action) is in flight; the rest queue FIFO.
//! 3. One dedicated event thread turns readiness into progress and
//!    appends finished operations to their port's queue.
//! 4. Any number of threads block in [`CompletionPorts::get_completion`]
//!    and receive completions in the order they finished.
//!
//! Every initiated operation completes exactly once: successfully, with
//! an OS error, timed out (see [`CompletionPorts::expire_ops`]) or
//! cancelled.

pub mod config;
pub mod op;
mod sys;
mod ports;

pub use config::CpeConfig;
pub use op::{Completion, OpBlock};
pub use ports::{CompletionPorts, CpeStats, PortId, WaitError};
