//! # pinio-sockport — Socket port
//!
//! Builds on `pinio-cpe`:
//!
//! - socket creation and typing (TCP/UDP), address resolution
//! - `listen` with an accept pool that is replenished on every accept
//!   completion or failure while the listener stays registered
//! - per-operation timeouts, enforced by a periodic sweep that cancels
//!   expired operations and completes them as timed out
//! - completion dispatch to a [`SocketCallback`] on threads borrowed
//!   from a `ThreadPool`; the event thread never runs user code
//!
//! Per-socket lifecycle:
//!
//! ```text
//! Unregistered ──listen/connect/bind──▶ Idle ⇄ InFlight ──close──▶ Closing ──drained──▶ (gone)
//! ```

pub mod config;
pub mod callback;
pub mod resolve;
mod port;
mod dispatch;

pub use callback::SocketCallback;
pub use config::SocketPortConfig;
pub use port::{SocketPort, SocketState};
pub use resolve::resolve;
