//! # pinio-gateway — Pin gateway
//!
//! The application-facing layer. Every accepted, connected or bound
//! socket becomes a *pin*: an application object (created by a
//! [`PinFactory`]) plus the gateway's bookkeeping for it:
//!
//! - an outbound chunk chain; `send` copies caller bytes, so buffers need
//!   not outlive the call, and bytes reach the wire in call order
//! - UDP inline framing so several datagrams to different destinations
//!   share one page
//! - a lazily sized inbound buffer: an 8-byte leader probe when the pin
//!   expects nothing more, a full chunk otherwise
//! - in-progress and invoking masks
//!
//! ## Callback sandwich
//!
//! ```text
//! lock → set invoking bit → unlock → user callback → lock → clear bit
//!      → closing and mask empty? hand to housekeeping → unlock
//! ```
//!
//! Callbacks for one pin never overlap: events that arrive while one is
//! running are queued and replayed by the thread already inside the pin.
//! `close` from inside a callback only marks the pin; the housekeeping
//! thread runs `on_close`, closes the socket and destroys the pin after
//! the callback has returned.

pub mod config;
pub mod frame;
pub mod outbound;
pub mod pin;
mod gateway;
mod housekeeping;
mod xray;

pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use outbound::Outbound;
pub use pin::{Pin, PinFactory, PinState, RecvAction};
pub use xray::XRay;

pub use pinio_core::{ActionMask, Error, Ident, Result};
