//! Final close on the housekeeping thread.
//!
//! Pins reach the pending queue only when none of their callbacks is
//! running. Final close then runs `on_close`, closes the socket (which
//! cancels whatever is still outstanding), drops the buffers and hands
//! the pin back to its factory.

use crate::gateway::{destroy_pin, Gateway, GatewayShared, PinEntry};
use crate::pin::PinState;

use pinio_core::ident::Ident;
use pinio_core::pool::Employer;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;

pub(crate) struct Housekeeper {
    gw: Weak<GatewayShared>,
}

impl Housekeeper {
    pub(crate) fn new(gw: Weak<GatewayShared>) -> Self {
        Self { gw }
    }
}

impl Employer for Housekeeper {
    fn has_job(&self, _: Ident) -> bool {
        self.gw
            .upgrade()
            .is_some_and(|shared| !shared.table.lock().pending.is_empty())
    }

    fn do_job(&self, _: Ident) {
        let Some(shared) = self.gw.upgrade() else {
            return;
        };
        let gw = Gateway { shared };
        while let Some(item) = gw.next_pending() {
            gw.final_close(item);
        }
    }
}

impl Gateway {
    /// Pop the next pin to finalize. It stays visible as
    /// `PendingFinalClose` until [`final_close`](Self::final_close) ends.
    pub(crate) fn next_pending(&self) -> Option<(Ident, PinEntry)> {
        let mut table = self.shared.table.lock();
        let (ident, entry) = table.pending.pop_front()?;
        table.finalizing.insert(ident);
        Some((ident, entry))
    }

    pub(crate) fn final_close(&self, (ident, mut entry): (Ident, PinEntry)) {
        let mask = entry.close_mask;
        let pin = entry.pin.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| pin.on_close(self, ident, mask))).is_err() {
            tracing::error!(pin = %ident, "pin callback panicked: on_close");
        }
        drop(pin);

        if let Err(e) = self.shared.sp.close(ident) {
            tracing::debug!(pin = %ident, error = %e, "socket close failed");
        }
        let discarded = entry.outbound.clear();
        entry.inbound = None;
        entry.state = PinState::Destroyed;

        destroy_pin(ident, &entry.factory, entry.pin);
        {
            let mut table = self.shared.table.lock();
            table.finalizing.remove(&ident);
            table.destroyed += 1;
        }
        tracing::debug!(pin = %ident, %mask, discarded, state = ?entry.state, "pin destroyed");
    }
}
