//! Non-blocking syscalls behind each action.
//!
//! `attempt` makes as much progress as the OS allows right now and
//! reports whether the operation finished. "Would block" is never an
//! error here; the event thread retries on the next readiness edge.

use crate::op::OpBlock;
use pinio_core::entry::Action;
use pinio_core::error::OpError;

use nix::errno::Errno;
use socket2::{SockAddr, SockRef};
use std::io;
use std::mem;
use std::os::fd::{BorrowedFd, RawFd};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))] {
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    } else {
        // SO_NOSIGPIPE is set on the socket instead.
        const SEND_FLAGS: libc::c_int = 0;
    }
}

pub(crate) enum Progress {
    Pending,
    Done,
}

pub(crate) fn attempt(fd: RawFd, op: &mut OpBlock) -> Progress {
    let result = match op.action {
        Action::Accept => accept(fd, op),
        Action::Connect => connect(fd, op),
        Action::Recv => receive(fd, op, |fd, buf| unsafe {
            libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0)
        }),
        Action::Read => receive(fd, op, |fd, buf| unsafe {
            libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
        }),
        Action::RecvFrom => recv_from(fd, op),
        Action::Send => transmit(fd, op, |fd, buf| unsafe {
            libc::send(fd, buf.as_ptr().cast(), buf.len(), SEND_FLAGS)
        }),
        Action::Write => transmit(fd, op, |fd, buf| unsafe {
            libc::write(fd, buf.as_ptr().cast(), buf.len())
        }),
        Action::SendTo => send_to(fd, op),
    };
    match result {
        Ok(progress) => progress,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Progress::Pending,
        Err(e) => {
            op.error = Some(OpError::from_io(&e));
            Progress::Done
        }
    }
}

#[inline]
fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(Errno::last().into())
    } else {
        Ok(ret as usize)
    }
}

fn retry<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn no_buffer() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "operation has no buffer")
}

fn no_address() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "operation has no address")
}

/// Single read into the op's span.
fn receive(
    fd: RawFd,
    op: &mut OpBlock,
    call: impl Fn(RawFd, &mut [u8]) -> isize,
) -> io::Result<Progress> {
    let span = op.span.clone();
    let buf = op.buf.as_mut().ok_or_else(no_buffer)?;
    let dst = &mut buf.raw_mut()[span];
    let n = retry(|| cvt(call(fd, &mut *dst)))?;
    op.transferred = n;
    Ok(Progress::Done)
}

/// Write the whole span, picking up where the previous attempt stopped.
fn transmit(
    fd: RawFd,
    op: &mut OpBlock,
    call: impl Fn(RawFd, &[u8]) -> isize,
) -> io::Result<Progress> {
    loop {
        let start = op.span.start + op.transferred;
        if start >= op.span.end {
            return Ok(Progress::Done);
        }
        let buf = op.buf.as_ref().ok_or_else(no_buffer)?;
        let src = &buf.raw()[start..op.span.end];
        let n = retry(|| cvt(call(fd, src)))?;
        if n == 0 {
            return Ok(Progress::Done);
        }
        op.transferred += n;
    }
}

fn recv_from(fd: RawFd, op: &mut OpBlock) -> io::Result<Progress> {
    let span = op.span.clone();
    let buf = op.buf.as_mut().ok_or_else(no_buffer)?;
    let dst = &mut buf.raw_mut()[span];
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = retry(|| {
        len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::recvfrom(
                fd,
                dst.as_mut_ptr().cast(),
                dst.len(),
                0,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        })
    })?;
    // SAFETY: recvfrom initialised `len` bytes of `storage`.
    let from = unsafe { SockAddr::new(storage, len) };
    op.addr = from.as_socket();
    op.transferred = n;
    Ok(Progress::Done)
}

fn send_to(fd: RawFd, op: &mut OpBlock) -> io::Result<Progress> {
    let dest = SockAddr::from(op.addr.ok_or_else(no_address)?);
    let buf = op.buf.as_ref().ok_or_else(no_buffer)?;
    let src = &buf.raw()[op.span.clone()];
    let n = retry(|| {
        cvt(unsafe {
            libc::sendto(
                fd,
                src.as_ptr().cast(),
                src.len(),
                SEND_FLAGS,
                dest.as_ptr().cast(),
                dest.len(),
            )
        })
    })?;
    op.transferred = n;
    Ok(Progress::Done)
}

fn accept(fd: RawFd, op: &mut OpBlock) -> io::Result<Progress> {
    // SAFETY: the registry keeps `fd` open while it is registered.
    let listener = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = SockRef::from(&listener);
    let (conn, peer) = retry(|| sock.accept())?;
    conn.set_nonblocking(true)?;
    op.addr = peer.as_socket();
    op.accepted = Some(conn);
    Ok(Progress::Done)
}

fn connect(fd: RawFd, op: &mut OpBlock) -> io::Result<Progress> {
    // SAFETY: the registry keeps `fd` open while it is registered.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let sock = SockRef::from(&borrowed);
    if !op.started {
        let dest = SockAddr::from(op.addr.ok_or_else(no_address)?);
        return match sock.connect(&dest) {
            Ok(()) => Ok(Progress::Done),
            Err(e) if in_progress(&e) => {
                op.started = true;
                Ok(Progress::Pending)
            }
            Err(e) => Err(e),
        };
    }
    if let Some(e) = sock.take_error()? {
        return Err(e);
    }
    match sock.peer_addr() {
        Ok(_) => Ok(Progress::Done),
        Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(Progress::Pending),
        Err(e) => Err(e),
    }
}

fn in_progress(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EINTR)
    ) || e.kind() == io::ErrorKind::WouldBlock
}
