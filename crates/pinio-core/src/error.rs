//! pinio error types.
//!
//! Two channels: [`Error`] is returned from synchronous setup calls;
//! [`OpError`] rides inside a completed operation and is what callbacks
//! see when an async action fails, times out or is cancelled.

use crate::ident::Ident;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Handle is not registered (or was closed).
    InvalidHandle,
    /// Ident does not name a live object.
    NotFound(Ident),
    /// Object exists but cannot accept this call in its current state.
    InvalidState(&'static str),
    /// The completion port has been closed.
    PortClosed,
    /// Memory budget exhausted.
    NoMemory,
    /// No thread left to borrow.
    PoolExhausted,
    /// Address could not be resolved.
    Resolve(String),
    /// Payload does not fit in a single chunk.
    TooLarge(usize),
    /// Datagram has no destination and the socket is not connected.
    NoDestination,
    /// Factory declined to create a pin.
    Refused,
    /// Runtime is shutting down.
    ShuttingDown,
    /// Configuration value out of range.
    InvalidConfig(&'static str),
    /// OS error from a synchronous call.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::NotFound(id) => write!(f, "no such object: {}", id),
            Self::InvalidState(what) => write!(f, "invalid state: {}", what),
            Self::PortClosed => write!(f, "completion port closed"),
            Self::NoMemory => write!(f, "memory budget exhausted"),
            Self::PoolExhausted => write!(f, "thread pool exhausted"),
            Self::Resolve(addr) => write!(f, "cannot resolve address: {}", addr),
            Self::TooLarge(n) => write!(f, "payload too large: {} bytes", n),
            Self::NoDestination => write!(f, "datagram has no destination"),
            Self::Refused => write!(f, "factory refused to create a pin"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::InvalidConfig(what) => write!(f, "invalid config: {}", what),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error slot of a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
    /// Cancelled by `cancel_io`, socket close or port close.
    Cancelled,
    /// Absolute expiry passed before the operation finished.
    TimedOut,
    /// OS error code (errno).
    Os(i32),
}

impl OpError {
    pub fn from_io(e: &io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Self::Os(code),
            None if e.kind() == io::ErrorKind::TimedOut => Self::TimedOut,
            None => Self::Os(0),
        }
    }

    pub fn to_io(self) -> io::Error {
        match self {
            Self::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "operation cancelled"),
            Self::TimedOut => io::Error::new(io::ErrorKind::TimedOut, "operation timed out"),
            Self::Os(code) => io::Error::from_raw_os_error(code),
        }
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Os(code) => write!(f, "{}", io::Error::from_raw_os_error(*code)),
        }
    }
}

impl std::error::Error for OpError {}
