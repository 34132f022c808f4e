//! Operation blocks and completions.

use pinio_core::buffer::Chunk;
use pinio_core::entry::{Action, CompletionKey};
use pinio_core::error::OpError;

use socket2::Socket;
use std::net::SocketAddr;
use std::ops::Range;
use std::time::{Duration, Instant};

/// One asynchronous operation.
///
/// Owned by the caller until initiated, by the completion port while in
/// flight, and handed back inside a [`Completion`]. The buffer travels
/// with the block, so nothing the operation touches can be freed early.
pub struct OpBlock {
    pub(crate) id: u64,
    pub(crate) action: Action,
    pub(crate) buf: Option<Chunk>,
    /// Absolute byte range of `buf` to read into / write from.
    pub(crate) span: Range<usize>,
    /// Destination (connect, send_to) or source (recv_from, accept).
    pub(crate) addr: Option<SocketAddr>,
    pub(crate) accepted: Option<Socket>,
    pub(crate) transferred: usize,
    pub(crate) error: Option<OpError>,
    pub(crate) expiry: Option<Instant>,
    pub(crate) user: u64,
    /// Connect has been issued and is in progress.
    pub(crate) started: bool,
}

impl OpBlock {
    fn new(action: Action, buf: Option<Chunk>, span: Range<usize>, addr: Option<SocketAddr>) -> Box<Self> {
        Box::new(Self {
            id: 0,
            action,
            buf,
            span,
            addr,
            accepted: None,
            transferred: 0,
            error: None,
            expiry: None,
            user: 0,
            started: false,
        })
    }

    pub fn accept() -> Box<Self> {
        Self::new(Action::Accept, None, 0..0, None)
    }

    pub fn connect(addr: SocketAddr) -> Box<Self> {
        Self::new(Action::Connect, None, 0..0, Some(addr))
    }

    pub fn recv(buf: Chunk, span: Range<usize>) -> Box<Self> {
        Self::new(Action::Recv, Some(buf), span, None)
    }

    pub fn recv_from(buf: Chunk, span: Range<usize>) -> Box<Self> {
        Self::new(Action::RecvFrom, Some(buf), span, None)
    }

    pub fn read(buf: Chunk, span: Range<usize>) -> Box<Self> {
        Self::new(Action::Read, Some(buf), span, None)
    }

    pub fn send(buf: Chunk, span: Range<usize>) -> Box<Self> {
        Self::new(Action::Send, Some(buf), span, None)
    }

    pub fn send_to(buf: Chunk, span: Range<usize>, addr: SocketAddr) -> Box<Self> {
        Self::new(Action::SendTo, Some(buf), span, Some(addr))
    }

    pub fn write(buf: Chunk, span: Range<usize>) -> Box<Self> {
        Self::new(Action::Write, Some(buf), span, None)
    }

    pub fn with_expiry(mut self: Box<Self>, expiry: Option<Instant>) -> Box<Self> {
        self.expiry = expiry;
        self
    }

    /// Relative form of [`with_expiry`](Self::with_expiry); `None` and zero
    /// both mean "never expires".
    pub fn with_timeout(self: Box<Self>, timeout: Option<Duration>) -> Box<Self> {
        let expiry = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        self.with_expiry(expiry)
    }

    pub fn with_user(mut self: Box<Self>, user: u64) -> Box<Self> {
        self.user = user;
        self
    }

    /// Assigned when initiated; unique per `CompletionPorts`.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn error(&self) -> Option<OpError> {
        self.error
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn span(&self) -> Range<usize> {
        self.span.clone()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    pub fn user(&self) -> u64 {
        self.user
    }

    pub fn buf(&self) -> Option<&Chunk> {
        self.buf.as_ref()
    }

    pub fn take_buf(&mut self) -> Option<Chunk> {
        self.buf.take()
    }

    /// Socket produced by a successful accept (already non-blocking).
    pub fn take_accepted(&mut self) -> Option<Socket> {
        self.accepted.take()
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expiry, Some(at) if at <= now)
    }

    pub(crate) fn span_fits(&self) -> bool {
        match &self.buf {
            Some(buf) => self.span.start <= self.span.end && self.span.end <= buf.capacity(),
            None => true,
        }
    }

    pub(crate) fn reset_result(&mut self) {
        self.transferred = 0;
        self.error = None;
        self.started = false;
        self.accepted = None;
    }
}

impl std::fmt::Debug for OpBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpBlock")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("span", &self.span)
            .field("transferred", &self.transferred)
            .field("error", &self.error)
            .finish()
    }
}

/// One dequeued completion.
///
/// `op` is `None` for wake-ups posted with
/// [`post_completion`](crate::CompletionPorts::post_completion).
#[derive(Debug)]
pub struct Completion {
    pub key: CompletionKey,
    pub bytes: usize,
    pub op: Option<Box<OpBlock>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_never_expires() {
        let op = OpBlock::accept().with_timeout(Some(Duration::ZERO));
        assert!(op.expiry().is_none());
        let op = OpBlock::accept().with_timeout(None);
        assert!(!op.is_expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn test_timeout_sets_expiry() {
        let op = OpBlock::accept().with_timeout(Some(Duration::from_millis(10)));
        assert!(!op.is_expired(Instant::now()));
        assert!(op.is_expired(Instant::now() + Duration::from_millis(20)));
    }

    #[test]
    fn test_span_fits() {
        let op = OpBlock::recv(Chunk::detached(8), 0..8);
        assert!(op.span_fits());
        let op = OpBlock::recv(Chunk::detached(8), 4..9);
        assert!(!op.span_fits());
    }

    #[test]
    fn test_take_buf() {
        let mut op = OpBlock::send(Chunk::detached(4), 0..0).with_user(7);
        assert_eq!(op.user(), 7);
        assert!(op.take_buf().is_some());
        assert!(op.buf().is_none());
    }
}
