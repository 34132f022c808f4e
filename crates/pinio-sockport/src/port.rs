//! The socket port: socket table, operation submission and completion
//! processing.
//!
//! Lock order: socket table → CPE registry → port queue. Callbacks run
//! with no lock held.

use crate::callback::SocketCallback;
use crate::config::SocketPortConfig;
use crate::dispatch::Dispatcher;
use crate::resolve::resolve;

use pinio_core::buffer::Chunk;
use pinio_core::entry::{Action, CompletionKey, SocketKind};
use pinio_core::error::{Error, OpError, Result};
use pinio_core::ident::Ident;
use pinio_core::pool::{BorrowedThread, Employer, ThreadPool};
use pinio_core::slot::SlotMap;
use pinio_cpe::{Completion, CompletionPorts, CpeStats, OpBlock, PortId, WaitError};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Range;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observable socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Created, no OS socket yet.
    Unregistered,
    /// Registered, nothing outstanding.
    Idle,
    /// Registered with operations outstanding.
    InFlight,
    /// Close requested; waiting for outstanding operations to drain.
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unregistered,
    Registered,
    Closing,
}

struct ListenerEntry {
    current: usize,
    max: usize,
    userdata: u64,
}

struct SocketSlot {
    callback: Arc<dyn SocketCallback>,
    kind: SocketKind,
    phase: Phase,
    socket: Option<Socket>,
    listener: Option<ListenerEntry>,
    outstanding: usize,
}

impl SocketSlot {
    fn new(callback: Arc<dyn SocketCallback>, kind: SocketKind) -> Self {
        Self {
            callback,
            kind,
            phase: Phase::Unregistered,
            socket: None,
            listener: None,
            outstanding: 0,
        }
    }

    fn fd(&self) -> Result<RawFd> {
        self.socket
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::InvalidState("socket not open"))
    }

    fn state(&self) -> SocketState {
        match self.phase {
            Phase::Unregistered => SocketState::Unregistered,
            Phase::Closing => SocketState::Closing,
            Phase::Registered if self.outstanding > 0 => SocketState::InFlight,
            Phase::Registered => SocketState::Idle,
        }
    }

    /// Usable for send/recv.
    fn check_open(&self) -> Result<RawFd> {
        match self.phase {
            Phase::Registered => self.fd(),
            Phase::Closing => Err(Error::InvalidState("socket closing")),
            Phase::Unregistered => Err(Error::InvalidState("socket not open")),
        }
    }
}

pub(crate) struct Inner {
    cpe: CompletionPorts,
    port: PortId,
    config: SocketPortConfig,
    table: Mutex<SlotMap<SocketSlot>>,
    /// One completion parked between `has_job` and `do_job`, per
    /// dispatch thread.
    stash: Vec<Mutex<Option<Completion>>>,
    threads: Mutex<Vec<BorrowedThread>>,
    stopping: AtomicBool,
    epoch: Instant,
    next_sweep_ms: AtomicU64,
}

/// Socket-level API over one completion port.
///
/// Cheap to clone; all clones share the same table and dispatch threads.
#[derive(Clone)]
pub struct SocketPort {
    pub(crate) inner: Arc<Inner>,
}

fn new_socket(addr: &SocketAddr, kind: SocketKind) -> Result<Socket> {
    let (ty, proto) = match kind {
        SocketKind::Tcp => (Type::STREAM, Protocol::TCP),
        SocketKind::Udp => (Type::DGRAM, Protocol::UDP),
        SocketKind::File => return Err(Error::InvalidState("not a socket kind")),
    };
    let socket = Socket::new(Domain::for_address(*addr), ty, Some(proto))?;
    socket.set_nonblocking(true)?;
    #[cfg(target_vendor = "apple")]
    socket.set_nosigpipe(true)?;
    Ok(socket)
}

fn inet(addr: SockAddr) -> Result<SocketAddr> {
    addr.as_socket()
        .ok_or(Error::InvalidState("not an inet address"))
}

impl SocketPort {
    /// Start a completion port and borrow `config.dispatch_threads`
    /// threads from `threads` to drain it.
    pub fn start(config: SocketPortConfig, threads: Arc<dyn ThreadPool>) -> Result<Self> {
        config.validate()?;
        let cpe = CompletionPorts::start(config.cpe.clone())?;
        let port = cpe.create_port(None, None, CompletionKey::NONE, SocketKind::Tcp)?;
        let stash = (0..config.dispatch_threads).map(|_| Mutex::new(None)).collect();
        let sp = SocketPort {
            inner: Arc::new(Inner {
                cpe,
                port,
                config,
                table: Mutex::new(SlotMap::new()),
                stash,
                threads: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
                epoch: Instant::now(),
                next_sweep_ms: AtomicU64::new(0),
            }),
        };

        let employer: Arc<dyn Employer> = Arc::new(Dispatcher::new(Arc::downgrade(&sp.inner)));
        let mut borrowed = Vec::with_capacity(sp.inner.config.dispatch_threads);
        for i in 0..sp.inner.config.dispatch_threads {
            match threads.borrow_thread(Ident::new(i as u32, 0), employer.clone(), Duration::ZERO) {
                Ok(t) => borrowed.push(t),
                Err(e) => {
                    for t in &borrowed {
                        t.release();
                    }
                    sp.inner.stopping.store(true, Ordering::Release);
                    sp.inner.cpe.shutdown();
                    return Err(e);
                }
            }
        }
        *sp.inner.threads.lock() = borrowed;
        tracing::info!(
            port = %sp.inner.port,
            dispatch_threads = sp.inner.config.dispatch_threads,
            "socket port started"
        );
        Ok(sp)
    }

    pub fn config(&self) -> &SocketPortConfig {
        &self.inner.config
    }

    /// Create a socket record. The OS socket is created lazily by
    /// `listen`, `connect` or `bind`.
    pub fn create(&self, callback: Arc<dyn SocketCallback>, kind: SocketKind) -> Result<Ident> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if kind == SocketKind::File {
            return Err(Error::InvalidState("not a socket kind"));
        }
        Ok(self.inner.table.lock().insert(SocketSlot::new(callback, kind)))
    }

    fn register(&self, fd: RawFd, ident: Ident, kind: SocketKind) -> Result<()> {
        self.inner
            .cpe
            .create_port(Some(fd), Some(self.inner.port), CompletionKey(ident.as_u64()), kind)
            .map(|_| ())
    }

    /// Bind a TCP socket, start listening and keep `accept_pool` accepts
    /// outstanding. Returns the bound address.
    pub fn listen(
        &self,
        ident: Ident,
        port: u16,
        backlog: i32,
        address: &str,
        accept_pool: usize,
        userdata: u64,
    ) -> Result<SocketAddr> {
        let addr = resolve(address, port)?;
        let mut table = self.inner.table.lock();
        let slot = table.get_mut(ident).ok_or(Error::NotFound(ident))?;
        if slot.phase != Phase::Unregistered {
            return Err(Error::InvalidState("socket already open"));
        }
        if slot.kind != SocketKind::Tcp {
            return Err(Error::InvalidState("listen requires a TCP socket"));
        }

        let socket = new_socket(&addr, SocketKind::Tcp)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        let local = inet(socket.local_addr()?)?;
        self.register(socket.as_raw_fd(), ident, SocketKind::Tcp)?;

        slot.socket = Some(socket);
        slot.phase = Phase::Registered;
        slot.listener = Some(ListenerEntry {
            current: 0,
            max: accept_pool.max(1),
            userdata,
        });
        for _ in 0..accept_pool.max(1) {
            self.submit_accept(slot)?;
        }
        tracing::debug!(socket = %ident, %local, accept_pool, "listening");
        Ok(local)
    }

    fn submit_accept(&self, slot: &mut SocketSlot) -> Result<()> {
        let fd = slot.fd()?;
        let Some(listener) = slot.listener.as_mut() else {
            return Err(Error::InvalidState("not a listener"));
        };
        self.inner
            .cpe
            .initiate_accept(fd, OpBlock::accept().with_user(listener.userdata))?;
        listener.current += 1;
        slot.outstanding += 1;
        Ok(())
    }

    /// Top the listener's accept pool back up.
    fn replenish(&self, ident: Ident) {
        let mut table = self.inner.table.lock();
        let Some(slot) = table.get_mut(ident) else {
            return;
        };
        if slot.phase != Phase::Registered {
            return;
        }
        while let Some(l) = slot.listener.as_ref() {
            if l.current >= l.max {
                break;
            }
            if let Err(e) = self.submit_accept(slot) {
                tracing::warn!(socket = %ident, error = %e, "accept resubmit failed");
                break;
            }
        }
    }

    /// Start a connect. The outcome arrives as `on_connect` or `on_error`.
    pub fn connect(
        &self,
        ident: Ident,
        address: &str,
        port: u16,
        timeout: Option<Duration>,
        userdata: u64,
    ) -> Result<()> {
        let addr = resolve(address, port)?;
        self.connect_addr(ident, addr, timeout, userdata)
    }

    /// `connect` with an already resolved address.
    pub fn connect_addr(
        &self,
        ident: Ident,
        addr: SocketAddr,
        timeout: Option<Duration>,
        userdata: u64,
    ) -> Result<()> {
        let mut table = self.inner.table.lock();
        let slot = table.get_mut(ident).ok_or(Error::NotFound(ident))?;
        if slot.phase == Phase::Closing {
            return Err(Error::InvalidState("socket closing"));
        }
        if slot.listener.is_some() {
            return Err(Error::InvalidState("socket is listening"));
        }
        if slot.socket.is_none() {
            let socket = new_socket(&addr, slot.kind)?;
            self.register(socket.as_raw_fd(), ident, slot.kind)?;
            slot.socket = Some(socket);
            slot.phase = Phase::Registered;
        }
        if slot.kind == SocketKind::Tcp {
            if let Some(socket) = slot.socket.as_ref() {
                let _ = socket.set_nodelay(true);
            }
        }
        let fd = slot.fd()?;
        self.inner.cpe.initiate_connect(
            fd,
            OpBlock::connect(addr).with_timeout(timeout).with_user(userdata),
        )?;
        slot.outstanding += 1;
        tracing::trace!(socket = %ident, %addr, "connect started");
        Ok(())
    }

    /// Bind a socket to a local address (UDP endpoints, or a TCP client
    /// that needs a fixed source). Returns the bound address.
    pub fn bind(&self, ident: Ident, address: &str, port: u16) -> Result<SocketAddr> {
        let addr = resolve(address, port)?;
        let mut table = self.inner.table.lock();
        let slot = table.get_mut(ident).ok_or(Error::NotFound(ident))?;
        if slot.phase != Phase::Unregistered {
            return Err(Error::InvalidState("socket already open"));
        }
        let socket = new_socket(&addr, slot.kind)?;
        socket.bind(&addr.into())?;
        let local = inet(socket.local_addr()?)?;
        self.register(socket.as_raw_fd(), ident, slot.kind)?;
        slot.socket = Some(socket);
        slot.phase = Phase::Registered;
        Ok(local)
    }

    /// Send `span` of `chunk`. For UDP, `to` selects the destination.
    ///
    /// On `Err` the chunk has been dropped and no callback follows.
    pub fn send(
        &self,
        ident: Ident,
        chunk: Chunk,
        span: Range<usize>,
        to: Option<SocketAddr>,
        timeout: Option<Duration>,
        userdata: u64,
    ) -> Result<()> {
        let mut table = self.inner.table.lock();
        let slot = table.get_mut(ident).ok_or(Error::NotFound(ident))?;
        let fd = slot.check_open()?;
        let op = match (slot.kind, to) {
            (SocketKind::Udp, Some(addr)) => OpBlock::send_to(chunk, span, addr),
            _ => OpBlock::send(chunk, span),
        };
        let op = op.with_timeout(timeout).with_user(userdata);
        let action = op.action();
        match action {
            Action::SendTo => self.inner.cpe.initiate_send_to(fd, op)?,
            _ => self.inner.cpe.initiate_send(fd, op)?,
        };
        slot.outstanding += 1;
        Ok(())
    }

    /// Receive into the unfilled tail of `chunk` (`end..capacity`).
    ///
    /// On `Err` the chunk has been dropped and no callback follows.
    pub fn recv(
        &self,
        ident: Ident,
        chunk: Chunk,
        timeout: Option<Duration>,
        userdata: u64,
    ) -> Result<()> {
        let span = chunk.end()..chunk.capacity();
        if span.is_empty() {
            return Err(Error::InvalidState("receive buffer is full"));
        }
        let mut table = self.inner.table.lock();
        let slot = table.get_mut(ident).ok_or(Error::NotFound(ident))?;
        let fd = slot.check_open()?;
        match slot.kind {
            SocketKind::Udp => self.inner.cpe.initiate_recv_from(
                fd,
                OpBlock::recv_from(chunk, span).with_timeout(timeout).with_user(userdata),
            )?,
            _ => self.inner.cpe.initiate_recv(
                fd,
                OpBlock::recv(chunk, span).with_timeout(timeout).with_user(userdata),
            )?,
        };
        slot.outstanding += 1;
        Ok(())
    }

    /// Close a socket. Outstanding operations are cancelled and still
    /// reported through `on_error`; the OS socket is closed once the last
    /// one has been delivered. Closing twice, or closing an unknown
    /// socket, is a no-op.
    pub fn close(&self, ident: Ident) -> Result<()> {
        let mut table = self.inner.table.lock();
        let Some(slot) = table.get_mut(ident) else {
            return Ok(());
        };
        if slot.phase == Phase::Closing {
            return Ok(());
        }
        slot.phase = Phase::Closing;
        slot.listener = None;
        if slot.outstanding == 0 {
            if let Some(slot) = table.remove(ident) {
                self.release(ident, slot);
            }
            return Ok(());
        }
        if let Ok(fd) = slot.fd() {
            let cancelled = self.inner.cpe.cancel_io(fd, None).unwrap_or(0);
            tracing::trace!(socket = %ident, cancelled, "close requested");
        }
        Ok(())
    }

    fn release(&self, ident: Ident, slot: SocketSlot) {
        if let Some(socket) = slot.socket {
            let _ = self.inner.cpe.deregister(socket.as_raw_fd());
            drop(socket);
            tracing::trace!(socket = %ident, "socket closed");
        }
    }

    /// Remove a closing socket once nothing is outstanding.
    fn finish_close(&self, ident: Ident) {
        let mut table = self.inner.table.lock();
        let done = matches!(
            table.get(ident),
            Some(slot) if slot.phase == Phase::Closing && slot.outstanding == 0
        );
        if done {
            if let Some(slot) = table.remove(ident) {
                self.release(ident, slot);
            }
        }
    }

    pub fn get_peer_addr(&self, ident: Ident) -> Result<SocketAddr> {
        let table = self.inner.table.lock();
        let slot = table.get(ident).ok_or(Error::NotFound(ident))?;
        let socket = slot
            .socket
            .as_ref()
            .ok_or(Error::InvalidState("socket not open"))?;
        inet(socket.peer_addr()?)
    }

    pub fn get_sock_addr(&self, ident: Ident) -> Result<SocketAddr> {
        let table = self.inner.table.lock();
        let slot = table.get(ident).ok_or(Error::NotFound(ident))?;
        let socket = slot
            .socket
            .as_ref()
            .ok_or(Error::InvalidState("socket not open"))?;
        inet(socket.local_addr()?)
    }

    /// `None` once the socket is fully closed.
    pub fn state(&self, ident: Ident) -> Option<SocketState> {
        self.inner.table.lock().get(ident).map(SocketSlot::state)
    }

    pub fn kind(&self, ident: Ident) -> Option<SocketKind> {
        self.inner.table.lock().get(ident).map(|slot| slot.kind)
    }

    /// Number of live socket records.
    pub fn sockets(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn cpe_stats(&self) -> CpeStats {
        self.inner.cpe.stats()
    }

    pub fn dispatch_threads(&self) -> usize {
        self.inner.threads.lock().len()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Release the dispatch threads, close every socket and the port.
    /// Operations still outstanding are dropped without callbacks.
    pub fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads = std::mem::take(&mut *self.inner.threads.lock());
        for t in &threads {
            t.release();
        }
        for _ in &threads {
            let _ = self
                .inner
                .cpe
                .post_completion(self.inner.port, 0, CompletionKey::NONE, None);
        }
        let slots = self.inner.table.lock().drain();
        let closed = slots.len();
        for (ident, slot) in slots {
            self.release(ident, slot);
        }
        let _ = self.inner.cpe.close_port(self.inner.port);
        self.inner.cpe.shutdown();
        tracing::info!(closed, "socket port shut down");
    }

    // ── dispatch side ──────────────────────────────────────────────

    /// Run the timeout sweep if it is due. Only one thread wins each
    /// period.
    fn maybe_sweep(&self) {
        let now_ms = self.inner.epoch.elapsed().as_millis() as u64;
        let due = self.inner.next_sweep_ms.load(Ordering::Acquire);
        if now_ms < due {
            return;
        }
        let next = now_ms + self.inner.config.sweep_interval.as_millis() as u64;
        if self
            .inner
            .next_sweep_ms
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.inner.cpe.expire_ops(Instant::now());
        }
    }

    /// Wait up to one poll interval for a completion and park it for
    /// `do_job`.
    pub(crate) fn has_job(&self, thread: Ident) -> bool {
        if self.is_stopping() {
            return false;
        }
        let Some(stash) = self.inner.stash.get(thread.index() as usize) else {
            return false;
        };
        self.maybe_sweep();
        match self
            .inner
            .cpe
            .get_completion(self.inner.port, Some(self.inner.config.poll_interval))
        {
            Ok(completion) => {
                *stash.lock() = Some(completion);
                true
            }
            Err(WaitError::Timeout) => false,
            Err(e) => {
                tracing::trace!(error = %e, "dispatch port unavailable");
                std::thread::sleep(self.inner.config.poll_interval);
                false
            }
        }
    }

    pub(crate) fn do_job(&self, thread: Ident) {
        let completion = self
            .inner
            .stash
            .get(thread.index() as usize)
            .and_then(|stash| stash.lock().take());
        if let Some(completion) = completion {
            self.process(completion);
        }
    }

    fn invoke(&self, ident: Ident, what: &'static str, f: impl FnOnce()) {
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            tracing::error!(socket = %ident, callback = what, "socket callback panicked");
        }
    }

    /// Deliver one completion to its socket's callback.
    fn process(&self, completion: Completion) {
        let Some(mut op) = completion.op else {
            return;
        };
        let ident = Ident::from_u64(completion.key.0);
        let action = op.action();
        let user = op.user();

        let (callback, closing) = {
            let mut table = self.inner.table.lock();
            let Some(slot) = table.get_mut(ident) else {
                tracing::trace!(socket = %ident, ?action, "completion for closed socket dropped");
                return;
            };
            slot.outstanding = slot.outstanding.saturating_sub(1);
            if action == Action::Accept {
                if let Some(l) = slot.listener.as_mut() {
                    l.current = l.current.saturating_sub(1);
                }
            }
            (slot.callback.clone(), slot.phase == Phase::Closing)
        };

        if closing {
            let error = op.error().unwrap_or(OpError::Cancelled);
            let chunk = op.take_buf();
            drop(op);
            self.invoke(ident, "on_error", || {
                callback.on_error(self, ident, action, error, chunk, user)
            });
            self.finish_close(ident);
            return;
        }

        if let Some(error) = op.error() {
            if action == Action::Accept && error != OpError::Cancelled {
                self.replenish(ident);
            }
            let chunk = op.take_buf();
            self.invoke(ident, "on_error", || {
                callback.on_error(self, ident, action, error, chunk, user)
            });
            return;
        }

        match action {
            Action::Accept => {
                let peer = op.addr();
                let accepted = op.take_accepted();
                self.replenish(ident);
                let (Some(socket), Some(peer)) = (accepted, peer) else {
                    tracing::warn!(socket = %ident, "accept completed without a socket");
                    return;
                };
                match self.adopt(socket, callback.clone()) {
                    Ok(new) => self.invoke(ident, "on_accept", || {
                        callback.on_accept(self, ident, new, peer, user)
                    }),
                    Err(e) => tracing::warn!(socket = %ident, error = %e, "accepted socket dropped"),
                }
            }
            Action::Connect => {
                let peer = op
                    .addr()
                    .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                self.invoke(ident, "on_connect", || {
                    callback.on_connect(self, ident, peer, user)
                });
            }
            Action::Recv | Action::RecvFrom | Action::Read => {
                let bytes = op.transferred();
                let from = op.addr();
                if let Some(mut chunk) = op.take_buf() {
                    chunk.commit(bytes);
                    self.invoke(ident, "on_receive", || {
                        callback.on_receive(self, ident, chunk, bytes, from, user)
                    });
                }
            }
            Action::Send | Action::SendTo | Action::Write => {
                let bytes = op.transferred();
                if let Some(chunk) = op.take_buf() {
                    self.invoke(ident, "on_send", || {
                        callback.on_send(self, ident, chunk, bytes, user)
                    });
                }
            }
        }
    }

    /// Register an accepted connection as a new socket sharing the
    /// listener's callback.
    fn adopt(&self, socket: Socket, callback: Arc<dyn SocketCallback>) -> Result<Ident> {
        let _ = socket.set_nodelay(true);
        #[cfg(target_vendor = "apple")]
        let _ = socket.set_nosigpipe(true);
        let fd = socket.as_raw_fd();
        let mut table = self.inner.table.lock();
        let ident = table.insert(SocketSlot {
            callback,
            kind: SocketKind::Tcp,
            phase: Phase::Registered,
            socket: Some(socket),
            listener: None,
            outstanding: 0,
        });
        if let Err(e) = self.register(fd, ident, SocketKind::Tcp) {
            table.remove(ident);
            return Err(e);
        }
        Ok(ident)
    }
}

impl std::fmt::Debug for SocketPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPort")
            .field("port", &self.inner.port)
            .field("sockets", &self.sockets())
            .finish()
    }
}
