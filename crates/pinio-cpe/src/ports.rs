//! Port registry and the event thread.
//!
//! Lock order: registry → port queue. The registry lock is the "global
//! lock" under which the event thread maps a readiness event back to its
//! socket and port; port queues have their own lock so consumers blocked
//! in `get_completion` never contend with the event thread for long.

use crate::config::CpeConfig;
use crate::op::{Completion, OpBlock};
use crate::sys::{self, Progress};

use pinio_core::entry::{Action, CompletionKey, SocketKind};
use pinio_core::error::{Error, OpError, Result};
use pinio_core::ident::Ident;
use pinio_core::slot::SlotMap;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

const WAKE: Token = Token(usize::MAX);

// Tokens carry the whole ident, generation included.
const _: () = assert!(
    usize::BITS >= u64::BITS,
    "mio tokens must hold a full 64-bit ident"
);

#[inline]
fn token(id: Ident) -> Token {
    Token(id.as_u64() as usize)
}

#[inline]
fn token_ident(t: Token) -> Ident {
    Ident::from_u64(t.0 as u64)
}

/// Handle to one completion port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PortId(Ident);

impl PortId {
    pub fn ident(self) -> Ident {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port:{}", self.0)
    }
}

/// Why `get_completion` returned without a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    /// Port closed and its queue fully drained.
    Closed,
    InvalidPort,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "wait timed out"),
            Self::Closed => write!(f, "port closed"),
            Self::InvalidPort => write!(f, "invalid port"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Registry snapshot for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpeStats {
    pub ports: usize,
    pub sockets: usize,
    pub inflight: usize,
    pub queued: usize,
}

#[derive(Default)]
struct PortQueue {
    completions: VecDeque<Completion>,
    exit: bool,
    /// Threads inside `get_completion` (the loop-lock). A closed port is
    /// only dropped from the registry once this is zero.
    waiters: usize,
}

struct Port {
    queue: Mutex<PortQueue>,
    ready: Condvar,
}

impl Port {
    fn new() -> Self {
        Self {
            queue: Mutex::new(PortQueue::default()),
            ready: Condvar::new(),
        }
    }

    fn post(&self, completion: Completion) {
        let mut q = self.queue.lock();
        q.completions.push_back(completion);
        self.ready.notify_one();
    }

    fn complete(&self, key: CompletionKey, op: Box<OpBlock>) {
        let bytes = op.transferred;
        self.post(Completion {
            key,
            bytes,
            op: Some(op),
        });
    }

    fn fail(&self, key: CompletionKey, mut op: Box<OpBlock>, error: OpError) {
        op.error = Some(error);
        self.complete(key, op);
    }

    fn is_closing(&self) -> bool {
        self.queue.lock().exit
    }

    fn is_idle(&self) -> bool {
        let q = self.queue.lock();
        q.exit && q.waiters == 0 && q.completions.is_empty()
    }
}

struct SocketEntry {
    fd: RawFd,
    port: Ident,
    key: CompletionKey,
    kind: SocketKind,
    polled: bool,
    inflight: [Option<Box<OpBlock>>; Action::COUNT],
    queued: [VecDeque<Box<OpBlock>>; Action::COUNT],
}

impl SocketEntry {
    fn new(fd: RawFd, port: Ident, key: CompletionKey, kind: SocketKind) -> Self {
        Self {
            fd,
            port,
            key,
            kind,
            polled: false,
            inflight: Default::default(),
            queued: Default::default(),
        }
    }

    /// Drive the in-flight op of `slot`, and its successors, as far as
    /// the OS allows right now.
    fn pump(&mut self, port: &Port, slot: usize) {
        loop {
            let done = match self.inflight[slot].as_mut() {
                Some(op) => matches!(sys::attempt(self.fd, op), Progress::Done),
                None => return,
            };
            if !done {
                return;
            }
            if let Some(op) = self.inflight[slot].take() {
                port.complete(self.key, op);
            }
            self.inflight[slot] = self.queued[slot].pop_front();
        }
    }

    fn pump_all(&mut self, port: &Port) {
        for slot in 0..Action::COUNT {
            self.pump(port, slot);
        }
    }

    fn submit(&mut self, port: &Port, op: Box<OpBlock>) {
        let slot = op.action.index();
        if self.inflight[slot].is_some() {
            self.queued[slot].push_back(op);
        } else {
            self.inflight[slot] = Some(op);
            self.pump(port, slot);
        }
    }

    /// Cancel every op (`op_id == None`) or the one with that id.
    fn cancel(&mut self, port: &Port, op_id: Option<u64>) -> usize {
        let mut cancelled = 0;
        for slot in 0..Action::COUNT {
            match op_id {
                None => {
                    if let Some(op) = self.inflight[slot].take() {
                        port.fail(self.key, op, OpError::Cancelled);
                        cancelled += 1;
                    }
                    while let Some(op) = self.queued[slot].pop_front() {
                        port.fail(self.key, op, OpError::Cancelled);
                        cancelled += 1;
                    }
                }
                Some(id) => {
                    if self.inflight[slot].as_ref().map_or(false, |op| op.id == id) {
                        if let Some(op) = self.inflight[slot].take() {
                            port.fail(self.key, op, OpError::Cancelled);
                            cancelled += 1;
                        }
                        self.inflight[slot] = self.queued[slot].pop_front();
                        self.pump(port, slot);
                    } else if let Some(pos) = self.queued[slot].iter().position(|op| op.id == id) {
                        if let Some(op) = self.queued[slot].remove(pos) {
                            port.fail(self.key, op, OpError::Cancelled);
                            cancelled += 1;
                        }
                    }
                }
            }
        }
        cancelled
    }

    fn expire(&mut self, port: &Port, now: Instant) -> usize {
        let mut expired = 0;
        for slot in 0..Action::COUNT {
            let head_expired = self.inflight[slot]
                .as_ref()
                .map_or(false, |op| op.is_expired(now));
            if head_expired {
                if let Some(op) = self.inflight[slot].take() {
                    port.fail(self.key, op, OpError::TimedOut);
                    expired += 1;
                }
            }
            if self.queued[slot].iter().any(|op| op.is_expired(now)) {
                let queue = std::mem::take(&mut self.queued[slot]);
                for op in queue {
                    if op.is_expired(now) {
                        port.fail(self.key, op, OpError::TimedOut);
                        expired += 1;
                    } else {
                        self.queued[slot].push_back(op);
                    }
                }
            }
            if head_expired {
                self.inflight[slot] = self.queued[slot].pop_front();
                self.pump(port, slot);
            }
        }
        expired
    }
}

#[derive(Default)]
struct Registry {
    ports: SlotMap<Arc<Port>>,
    sockets: SlotMap<SocketEntry>,
    by_fd: HashMap<RawFd, Ident>,
}

impl Registry {
    fn lookup(&mut self, fd: RawFd) -> Result<(Arc<Port>, &mut SocketEntry)> {
        let id = *self.by_fd.get(&fd).ok_or(Error::InvalidHandle)?;
        let entry = self.sockets.get_mut(id).ok_or(Error::InvalidHandle)?;
        let port = self.ports.get(entry.port).cloned().ok_or(Error::PortClosed)?;
        Ok((port, entry))
    }

    /// Readiness changed for `id`: retry everything in flight on it.
    fn drive(&mut self, id: Ident) {
        let Registry { ports, sockets, .. } = self;
        if let Some(entry) = sockets.get_mut(id) {
            if let Some(port) = ports.get(entry.port) {
                entry.pump_all(port);
            }
        }
    }

    /// Cancel all ops, stop polling and forget the socket.
    fn remove_socket(&mut self, id: Ident, poll: &mio::Registry) -> usize {
        let Some(mut entry) = self.sockets.remove(id) else {
            return 0;
        };
        self.by_fd.remove(&entry.fd);
        let cancelled = match self.ports.get(entry.port) {
            Some(port) => entry.cancel(port, None),
            None => 0,
        };
        if entry.polled {
            if let Err(e) = poll.deregister(&mut SourceFd(&entry.fd)) {
                tracing::debug!(fd = entry.fd, error = %e, "deregister failed");
            }
        }
        tracing::trace!(fd = entry.fd, kind = ?entry.kind, cancelled, "handle deregistered");
        cancelled
    }

    fn reap(&mut self, port: Ident) {
        let idle = self.ports.get(port).map_or(false, |p| p.is_idle());
        if idle {
            self.ports.remove(port);
            tracing::trace!(%port, "closed port released");
        }
    }
}

struct Shared {
    registry: Mutex<Registry>,
    poll_registry: mio::Registry,
    waker: Waker,
    shutdown: AtomicBool,
    next_op: AtomicU64,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// Completion port emulation.
///
/// Cheap to clone; all clones share the registry and the event thread.
/// The event thread exits on [`shutdown`](Self::shutdown) or once every
/// clone has been dropped.
#[derive(Clone)]
pub struct CompletionPorts {
    shared: Arc<Shared>,
}

impl CompletionPorts {
    /// Create the registry and start the event thread.
    pub fn start(config: CpeConfig) -> Result<Self> {
        config.validate()?;
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE)?;
        let poll_registry = poll.registry().try_clone()?;
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            poll_registry,
            waker,
            shutdown: AtomicBool::new(false),
            next_op: AtomicU64::new(1),
            thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let handle = thread::Builder::new()
            .name("pinio-events".into())
            .spawn(move || event_loop(weak, poll, config))?;
        *shared.thread.lock() = Some(handle);

        Ok(Self { shared })
    }

    /// Register `socket` with a port under `key`.
    ///
    /// With `existing == None` a new port is created (and returned); with
    /// `socket == None` only the port is created.
    pub fn create_port(
        &self,
        socket: Option<RawFd>,
        existing: Option<PortId>,
        key: CompletionKey,
        kind: SocketKind,
    ) -> Result<PortId> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let mut reg = self.shared.registry.lock();
        let port = match existing {
            Some(id) => {
                let port = reg.ports.get(id.0).ok_or(Error::InvalidHandle)?;
                if port.is_closing() {
                    return Err(Error::PortClosed);
                }
                id.0
            }
            None => reg.ports.insert(Arc::new(Port::new())),
        };

        if let Some(fd) = socket {
            if reg.by_fd.contains_key(&fd) {
                if existing.is_none() {
                    reg.ports.remove(port);
                }
                return Err(Error::InvalidState("handle already registered"));
            }
            let id = reg.sockets.insert(SocketEntry::new(fd, port, key, kind));
            let polled = match self.shared.poll_registry.register(
                &mut SourceFd(&fd),
                token(id),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                Ok(()) => true,
                Err(e) if kind == SocketKind::File => {
                    tracing::trace!(fd, error = %e, "file handle is not pollable");
                    false
                }
                Err(e) => {
                    reg.sockets.remove(id);
                    if existing.is_none() {
                        reg.ports.remove(port);
                    }
                    return Err(e.into());
                }
            };
            if let Some(entry) = reg.sockets.get_mut(id) {
                entry.polled = polled;
            }
            reg.by_fd.insert(fd, id);
            tracing::trace!(fd, socket = %id, port = %port, ?kind, "handle registered");
        }
        Ok(PortId(port))
    }

    /// Submit `op` against `fd`; returns the op id.
    ///
    /// Queued behind any in-flight op of the same kind on that handle.
    /// If the handle's port is closing the op completes at once as
    /// cancelled.
    pub fn initiate(&self, fd: RawFd, mut op: Box<OpBlock>) -> Result<u64> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if !op.span_fits() {
            return Err(Error::InvalidState("span outside buffer"));
        }
        op.reset_result();
        op.id = self.shared.next_op.fetch_add(1, Ordering::Relaxed);
        let id = op.id;

        let mut reg = self.shared.registry.lock();
        let (port, entry) = reg.lookup(fd)?;
        if port.is_closing() {
            port.fail(entry.key, op, OpError::Cancelled);
        } else {
            entry.submit(&port, op);
        }
        Ok(id)
    }

    fn initiate_as(&self, action: Action, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        if op.action != action {
            return Err(Error::InvalidState("operation kind mismatch"));
        }
        self.initiate(fd, op)
    }

    pub fn initiate_accept(&self, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        self.initiate_as(Action::Accept, fd, op)
    }

    pub fn initiate_connect(&self, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        self.initiate_as(Action::Connect, fd, op)
    }

    pub fn initiate_recv(&self, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        self.initiate_as(Action::Recv, fd, op)
    }

    pub fn initiate_recv_from(&self, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        self.initiate_as(Action::RecvFrom, fd, op)
    }

    pub fn initiate_read(&self, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        self.initiate_as(Action::Read, fd, op)
    }

    pub fn initiate_send(&self, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        self.initiate_as(Action::Send, fd, op)
    }

    pub fn initiate_send_to(&self, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        self.initiate_as(Action::SendTo, fd, op)
    }

    pub fn initiate_write(&self, fd: RawFd, op: Box<OpBlock>) -> Result<u64> {
        self.initiate_as(Action::Write, fd, op)
    }

    /// Block until a completion is available on `port`.
    ///
    /// `timeout == None` waits forever. Completions are returned in the
    /// order they finished. After `close_port` the remaining completions
    /// (cancellations included) are still handed out; only then does this
    /// return `Closed`.
    pub fn get_completion(
        &self,
        port: PortId,
        timeout: Option<Duration>,
    ) -> std::result::Result<Completion, WaitError> {
        let p = {
            let reg = self.shared.registry.lock();
            match reg.ports.get(port.0) {
                Some(p) => p.clone(),
                None if reg.ports.is_retired(port.0) => return Err(WaitError::Closed),
                None => return Err(WaitError::InvalidPort),
            }
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut q = p.queue.lock();
        q.waiters += 1;
        let result = loop {
            if let Some(completion) = q.completions.pop_front() {
                break Ok(completion);
            }
            if q.exit {
                break Err(WaitError::Closed);
            }
            match deadline {
                None => p.ready.wait(&mut q),
                Some(at) => {
                    if p.ready.wait_until(&mut q, at).timed_out()
                        && q.completions.is_empty()
                        && !q.exit
                    {
                        break Err(WaitError::Timeout);
                    }
                }
            }
        };
        q.waiters -= 1;
        let reap = q.exit && q.waiters == 0 && q.completions.is_empty();
        drop(q);

        if reap {
            self.shared.registry.lock().reap(port.0);
        }
        result
    }

    /// Inject a completion (wake-ups, hand-offs between threads).
    pub fn post_completion(
        &self,
        port: PortId,
        bytes: usize,
        key: CompletionKey,
        op: Option<Box<OpBlock>>,
    ) -> Result<()> {
        let p = self
            .shared
            .registry
            .lock()
            .ports
            .get(port.0)
            .cloned()
            .ok_or(Error::InvalidHandle)?;
        p.post(Completion { key, bytes, op });
        Ok(())
    }

    /// Close `port`: wake every waiter and cancel every op of every handle
    /// registered with it. Returns the number of ops cancelled.
    pub fn close_port(&self, port: PortId) -> Result<usize> {
        let mut reg = self.shared.registry.lock();
        let p = reg.ports.get(port.0).cloned().ok_or(Error::InvalidHandle)?;
        {
            let mut q = p.queue.lock();
            if q.exit {
                return Ok(0);
            }
            q.exit = true;
        }

        let members: Vec<Ident> = reg
            .sockets
            .iter()
            .filter(|(_, entry)| entry.port == port.0)
            .map(|(id, _)| id)
            .collect();
        let mut cancelled = 0;
        for id in members {
            cancelled += reg.remove_socket(id, &self.shared.poll_registry);
        }
        p.ready.notify_all();
        reg.reap(port.0);
        tracing::debug!(%port, cancelled, "port closed");
        Ok(cancelled)
    }

    /// Cancel one op (by id) or all ops on `fd`. Each cancelled op still
    /// completes, with `OpError::Cancelled`.
    pub fn cancel_io(&self, fd: RawFd, op_id: Option<u64>) -> Result<usize> {
        let mut reg = self.shared.registry.lock();
        let (port, entry) = reg.lookup(fd)?;
        Ok(entry.cancel(&port, op_id))
    }

    /// Cancel all ops on `fd` and stop tracking it. The caller closes the
    /// descriptor afterwards.
    pub fn deregister(&self, fd: RawFd) -> Result<usize> {
        let mut reg = self.shared.registry.lock();
        let id = *reg.by_fd.get(&fd).ok_or(Error::InvalidHandle)?;
        let port = reg.sockets.get(id).map(|entry| entry.port);
        let cancelled = reg.remove_socket(id, &self.shared.poll_registry);
        if let Some(port) = port {
            reg.reap(port);
        }
        Ok(cancelled)
    }

    /// Complete every op whose expiry is at or before `now` with
    /// `OpError::TimedOut`. Returns how many expired.
    pub fn expire_ops(&self, now: Instant) -> usize {
        let mut reg = self.shared.registry.lock();
        let Registry { ports, sockets, .. } = &mut *reg;
        let mut expired = 0;
        for (_, entry) in sockets.iter_mut() {
            if let Some(port) = ports.get(entry.port) {
                expired += entry.expire(port, now);
            }
        }
        if expired > 0 {
            tracing::debug!(expired, "operations timed out");
        }
        expired
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.shared.registry.lock().by_fd.contains_key(&fd)
    }

    pub fn stats(&self) -> CpeStats {
        let reg = self.shared.registry.lock();
        let mut stats = CpeStats {
            ports: reg.ports.len(),
            sockets: reg.sockets.len(),
            ..CpeStats::default()
        };
        for (_, entry) in reg.sockets.iter() {
            stats.inflight += entry.inflight.iter().filter(|op| op.is_some()).count();
            stats.queued += entry.queued.iter().map(VecDeque::len).sum::<usize>();
        }
        stats
    }

    /// Stop the event thread and close every port.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.shared.thread.lock().take() {
            let _ = handle.join();
        }
        let ports = self.shared.registry.lock().ports.idents();
        for id in ports {
            let _ = self.close_port(PortId(id));
        }
        // Completions nobody will collect any more.
        let leftover = self.shared.registry.lock().ports.drain();
        let dropped: usize = leftover
            .iter()
            .map(|(_, port)| {
                let mut q = port.queue.lock();
                let n = q.completions.len();
                q.completions.clear();
                n
            })
            .sum();
        tracing::debug!(dropped, "completion ports shut down");
    }
}

/// The event thread: readiness in, progress and completions out.
fn event_loop(shared: Weak<Shared>, mut poll: Poll, config: CpeConfig) {
    let mut events = Events::with_capacity(config.events_capacity);
    let mut ready: Vec<Ident> = Vec::with_capacity(config.events_capacity);
    tracing::debug!("event thread started");

    loop {
        if let Err(e) = poll.poll(&mut events, Some(config.poll_tick)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %e, "poll failed; event thread exiting");
            break;
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        ready.clear();
        ready.extend(
            events
                .iter()
                .map(|event| event.token())
                .filter(|t| *t != WAKE)
                .map(token_ident),
        );
        if ready.is_empty() {
            continue;
        }

        let mut reg = shared.registry.lock();
        for id in ready.iter() {
            reg.drive(*id);
        }
    }

    tracing::debug!("event thread stopped");
}
