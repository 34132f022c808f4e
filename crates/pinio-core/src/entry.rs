//! Completion keys, action kinds and socket kinds.

use crate::mask::ActionMask;
use core::fmt;

/// Opaque value registered with a socket and returned with every
/// completion for it. Upper layers store the socket's `Ident` here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CompletionKey(pub u64);

impl CompletionKey {
    pub const NONE: CompletionKey = CompletionKey(u64::MAX);
}

/// Kind of asynchronous operation.
///
/// At most one operation per (socket, action) is in flight; further
/// operations of the same kind wait in a FIFO behind it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Accept = 0,
    Connect = 1,
    Recv = 2,
    RecvFrom = 3,
    Read = 4,
    Send = 5,
    SendTo = 6,
    Write = 7,
}

impl Action {
    pub const COUNT: usize = 8;

    pub const ALL: [Action; Action::COUNT] = [
        Action::Accept,
        Action::Connect,
        Action::Recv,
        Action::RecvFrom,
        Action::Read,
        Action::Send,
        Action::SendTo,
        Action::Write,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The gateway-level bit this action reports under.
    pub const fn mask_bit(self) -> ActionMask {
        match self {
            Action::Accept => ActionMask::ACCEPT,
            Action::Connect => ActionMask::CONNECT,
            Action::Recv | Action::RecvFrom | Action::Read => ActionMask::RECV,
            Action::Send | Action::SendTo | Action::Write => ActionMask::SEND,
        }
    }

    /// True if the operation waits for the handle to become readable.
    pub const fn is_inbound(self) -> bool {
        matches!(
            self,
            Action::Accept | Action::Recv | Action::RecvFrom | Action::Read
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Accept => "accept",
            Action::Connect => "connect",
            Action::Recv => "recv",
            Action::RecvFrom => "recv_from",
            Action::Read => "read",
            Action::Send => "send",
            Action::SendTo => "send_to",
            Action::Write => "write",
        };
        f.write_str(name)
    }
}

/// Type of handle registered with a completion port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Udp,
    /// Non-pollable descriptor; read/write complete synchronously.
    File,
}

impl SocketKind {
    #[inline]
    pub const fn is_pollable(self) -> bool {
        !matches!(self, SocketKind::File)
    }
}
