//! Application-facing pin contract.

use crate::gateway::Gateway;
use pinio_core::ident::Ident;
use pinio_core::mask::ActionMask;
use std::net::SocketAddr;
use std::sync::Arc;

/// What to do after `on_recv` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvAction {
    /// Re-arm the receive.
    pub keep_going: bool,
    /// Re-arm with a full chunk (`true`) or the leader probe (`false`).
    pub expect_more: bool,
}

impl RecvAction {
    pub const STOP: RecvAction = RecvAction {
        keep_going: false,
        expect_more: false,
    };

    pub const fn more() -> Self {
        Self {
            keep_going: true,
            expect_more: true,
        }
    }

    pub const fn probe() -> Self {
        Self {
            keep_going: true,
            expect_more: false,
        }
    }
}

/// Pin lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinState {
    Live,
    /// Closed while a callback was running; waits for it to return.
    ClosingDeferred,
    /// Queued for the housekeeping thread.
    PendingFinalClose,
    Destroyed,
}

/// One logical connection, implemented by the application.
///
/// All callbacks for one pin are serialized. They may call back into the
/// gateway, including `close` on their own ident.
pub trait Pin: Send + Sync {
    /// Created from an accepted connection on `listener`.
    fn on_accept(&self, gw: &Gateway, ident: Ident, listener: Ident, peer: SocketAddr) {
        let _ = (gw, ident, listener, peer);
    }

    fn on_connect(&self, gw: &Gateway, ident: Ident, peer: SocketAddr) {
        let _ = (gw, ident, peer);
    }

    /// Received bytes (TCP) or one datagram (UDP, with its source).
    fn on_recv(
        &self,
        gw: &Gateway,
        ident: Ident,
        data: &[u8],
        from: Option<SocketAddr>,
    ) -> RecvAction;

    /// Everything queued so far has been sent.
    fn on_send(&self, gw: &Gateway, ident: Ident) {
        let _ = (gw, ident);
    }

    /// Delivered exactly once, on the housekeeping thread. `mask` names
    /// the action and the reason.
    fn on_close(&self, gw: &Gateway, ident: Ident, mask: ActionMask) {
        let _ = (gw, ident, mask);
    }
}

/// Creates pins for new connections and disposes of them after final
/// close.
pub trait PinFactory: Send + Sync {
    /// `arg` is the value given to `listen`/`connect`/`bind`. Returning
    /// `None` refuses the connection.
    fn create(&self, ident: Ident, arg: u64) -> Option<Arc<dyn Pin>>;

    fn destroy(&self, pin: Arc<dyn Pin>) {
        drop(pin);
    }
}
