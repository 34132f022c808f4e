//! Employer that drains the completion port on borrowed threads.

use crate::port::{Inner, SocketPort};
use pinio_core::ident::Ident;
use pinio_core::pool::Employer;
use std::sync::Weak;

/// Holds the port weakly so dropping the last `SocketPort` lets the
/// borrowed threads go back to their pool.
pub(crate) struct Dispatcher {
    port: Weak<Inner>,
}

impl Dispatcher {
    pub(crate) fn new(port: Weak<Inner>) -> Self {
        Self { port }
    }

    fn port(&self) -> Option<SocketPort> {
        self.port.upgrade().map(|inner| SocketPort { inner })
    }
}

impl Employer for Dispatcher {
    fn has_job(&self, thread: Ident) -> bool {
        self.port().is_some_and(|sp| sp.has_job(thread))
    }

    fn do_job(&self, thread: Ident) {
        if let Some(sp) = self.port() {
            sp.do_job(thread);
        }
    }
}
