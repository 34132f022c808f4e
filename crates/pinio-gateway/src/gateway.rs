//! Pin table, socket-port callbacks and the callback sandwich.
//!
//! Lock order: pin table → socket port table → CPE registry → port queue.
//! The pin table lock is never held while user code runs.

use crate::config::GatewayConfig;
use crate::housekeeping::Housekeeper;
use crate::outbound::{Outbound, PendingSend};
use crate::pin::{Pin, PinFactory, PinState, RecvAction};
use crate::xray::XRay;

use pinio_core::buffer::{Chunk, ChunkProvider, MemoryBudget, Reservation, LEADER_SIZE};
use pinio_core::entry::{Action, SocketKind};
use pinio_core::error::{Error, OpError, Result};
use pinio_core::ident::Ident;
use pinio_core::mask::ActionMask;
use pinio_core::pool::{BorrowedThread, Employer, ThreadPool};
use pinio_module::ChunkPool;
use pinio_sockport::{resolve, SocketCallback, SocketPort};

use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// A completion waiting to be delivered to a pin.
pub(crate) enum PinEvent {
    Accept { listener: Ident, peer: SocketAddr },
    Connect { peer: SocketAddr },
    Recv { chunk: Chunk, from: Option<SocketAddr> },
    Sent,
}

impl PinEvent {
    fn bit(&self) -> ActionMask {
        match self {
            Self::Accept { .. } => ActionMask::ACCEPT,
            Self::Connect { .. } => ActionMask::CONNECT,
            Self::Recv { .. } => ActionMask::RECV,
            Self::Sent => ActionMask::SEND,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Accept { .. } => "on_accept",
            Self::Connect { .. } => "on_connect",
            Self::Recv { .. } => "on_recv",
            Self::Sent => "on_send",
        }
    }
}

pub(crate) struct PinEntry {
    pub(crate) pin: Arc<dyn Pin>,
    pub(crate) factory: Arc<dyn PinFactory>,
    kind: SocketKind,
    pub(crate) state: PinState,
    pub(crate) outbound: Outbound,
    /// Page kept from the last receive for the next one.
    pub(crate) inbound: Option<Chunk>,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
    /// Actions with an operation outstanding in the socket port.
    in_progress: ActionMask,
    /// Callback currently running.
    invoking: ActionMask,
    pub(crate) close_mask: ActionMask,
    /// `recv` called from inside `on_recv`.
    rearm: Option<bool>,
    /// Events that arrived while a callback was running.
    deferred: VecDeque<PinEvent>,
    _record: Reservation,
}

struct Listener {
    factory: Arc<dyn PinFactory>,
    arg: u64,
}

#[derive(Default)]
pub(crate) struct Table {
    pins: HashMap<Ident, PinEntry>,
    listeners: HashMap<Ident, Listener>,
    pub(crate) pending: VecDeque<(Ident, PinEntry)>,
    /// Taken off `pending` and not yet destroyed.
    pub(crate) finalizing: HashSet<Ident>,
    pub(crate) destroyed: u64,
}

pub(crate) struct GatewayShared {
    config: GatewayConfig,
    pub(crate) sp: SocketPort,
    pages: ChunkPool,
    threads: Arc<dyn ThreadPool>,
    pub(crate) table: Mutex<Table>,
    link: Arc<dyn SocketCallback>,
    housekeeper: Mutex<Option<BorrowedThread>>,
    stopping: AtomicBool,
}

/// The pin gateway.
///
/// Cheap to clone. All calls are non-blocking apart from name resolution
/// in `listen`/`connect`/`bind`.
#[derive(Clone)]
pub struct Gateway {
    pub(crate) shared: Arc<GatewayShared>,
}

/// Close reason for an operation that failed in the socket port.
fn op_reason(error: OpError) -> ActionMask {
    match error {
        OpError::TimedOut => ActionMask::TIMEOUT,
        OpError::Cancelled => ActionMask::ERROR,
        OpError::Os(_) => match error.to_io().kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ActionMask::PEER_CLOSED,
            _ => ActionMask::ERROR,
        },
    }
}

/// Close reason for a synchronous failure.
fn call_reason(error: &Error) -> ActionMask {
    match error {
        Error::NoMemory => ActionMask::NO_MEMORY,
        _ => ActionMask::ERROR,
    }
}

pub(crate) fn destroy_pin(ident: Ident, factory: &Arc<dyn PinFactory>, pin: Arc<dyn Pin>) {
    if panic::catch_unwind(AssertUnwindSafe(|| factory.destroy(pin))).is_err() {
        tracing::error!(pin = %ident, "pin factory destroy panicked");
    }
}

impl Gateway {
    /// Start a gateway. Borrows `config.threads_needed()` threads from
    /// `threads`: the socket port's dispatch threads plus one
    /// housekeeping thread.
    pub fn start(config: GatewayConfig, threads: Arc<dyn ThreadPool>) -> Result<Self> {
        config.validate()?;
        let budget = Arc::new(MemoryBudget::new(config.memory_budget));
        let pages = ChunkPool::new(budget, config.chunk_cache);
        let sp = SocketPort::start(config.sockport.clone(), threads.clone())?;

        let shared = Arc::new_cyclic(|weak: &Weak<GatewayShared>| GatewayShared {
            config,
            sp,
            pages,
            threads: threads.clone(),
            table: Mutex::new(Table::default()),
            link: Arc::new(GatewayLink {
                shared: weak.clone(),
            }),
            housekeeper: Mutex::new(None),
            stopping: AtomicBool::new(false),
        });
        let gw = Gateway { shared };

        let employer: Arc<dyn Employer> = Arc::new(Housekeeper::new(Arc::downgrade(&gw.shared)));
        match threads.borrow_thread(Ident::new(0, 0), employer, gw.shared.config.housekeeping_idle) {
            Ok(t) => *gw.shared.housekeeper.lock() = Some(t),
            Err(e) => {
                gw.shared.sp.shutdown();
                return Err(e);
            }
        }
        tracing::info!(
            memory_budget = gw.shared.config.memory_budget,
            dispatch_threads = gw.shared.config.sockport.dispatch_threads,
            "gateway started"
        );
        Ok(gw)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    pub fn socket_port(&self) -> &SocketPort {
        &self.shared.sp
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        self.shared.pages.budget()
    }

    fn check_running(&self) -> Result<()> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Insert a new pin unless shutdown has begun. `shutdown` raises
    /// `stopping` before it walks the table, so a pin admitted here is
    /// always seen by that walk.
    fn admit(
        &self,
        table: &mut Table,
        ident: Ident,
        entry: PinEntry,
    ) -> std::result::Result<(), PinEntry> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(entry);
        }
        table.pins.insert(ident, entry);
        Ok(())
    }

    fn new_entry(
        &self,
        ident: Ident,
        kind: SocketKind,
        factory: Arc<dyn PinFactory>,
        arg: u64,
    ) -> Result<PinEntry> {
        let record = self
            .shared
            .pages
            .reserve(std::mem::size_of::<PinEntry>())
            .ok_or(Error::NoMemory)?;
        let pin = panic::catch_unwind(AssertUnwindSafe(|| factory.create(ident, arg)))
            .unwrap_or_else(|_| {
                tracing::error!(pin = %ident, "pin factory create panicked");
                None
            })
            .ok_or(Error::Refused)?;
        Ok(PinEntry {
            pin,
            factory,
            kind,
            state: PinState::Live,
            outbound: Outbound::new(kind),
            inbound: None,
            send_timeout: self.shared.config.send_timeout,
            recv_timeout: self.shared.config.recv_timeout,
            in_progress: ActionMask::NONE,
            invoking: ActionMask::NONE,
            close_mask: ActionMask::NONE,
            rearm: None,
            deferred: VecDeque::new(),
            _record: record,
        })
    }

    // ── setup ──────────────────────────────────────────────────────

    /// Listen for TCP connections; each accepted one becomes a pin made
    /// by `factory` and gets `on_accept`. Returns the listener ident and
    /// the bound address.
    pub fn listen(
        &self,
        address: &str,
        port: u16,
        backlog: i32,
        accept_pool: usize,
        factory: Arc<dyn PinFactory>,
        arg: u64,
    ) -> Result<(Ident, SocketAddr)> {
        self.check_running()?;
        let sp = &self.shared.sp;
        let ident = sp.create(self.shared.link.clone(), SocketKind::Tcp)?;
        self.shared
            .table
            .lock()
            .listeners
            .insert(ident, Listener { factory, arg });
        match sp.listen(ident, port, backlog, address, accept_pool, arg) {
            Ok(local) => {
                tracing::info!(listener = %ident, %local, accept_pool, "listening");
                Ok((ident, local))
            }
            Err(e) => {
                self.shared.table.lock().listeners.remove(&ident);
                let _ = sp.close(ident);
                Err(e)
            }
        }
    }

    /// Stop listening. Pins already accepted are unaffected.
    pub fn deaf(&self, listener: Ident) -> Result<()> {
        if self.shared.table.lock().listeners.remove(&listener).is_none() {
            return Err(Error::NotFound(listener));
        }
        tracing::debug!(%listener, "listener closed");
        self.shared.sp.close(listener)
    }

    /// Connect to `address:port`. The pin exists from this call on; it
    /// gets `on_connect`, or `on_close` with `CONNECT` and the reason.
    pub fn connect(
        &self,
        address: &str,
        port: u16,
        factory: Arc<dyn PinFactory>,
        arg: u64,
        timeout: Option<Duration>,
    ) -> Result<Ident> {
        self.check_running()?;
        let addr = resolve(address, port)?;
        let sp = &self.shared.sp;
        let ident = sp.create(self.shared.link.clone(), SocketKind::Tcp)?;
        let mut entry = match self.new_entry(ident, SocketKind::Tcp, factory, arg) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = sp.close(ident);
                return Err(e);
            }
        };
        entry.in_progress.insert(ActionMask::CONNECT);

        let mut table = self.shared.table.lock();
        if let Err(entry) = self.admit(&mut table, ident, entry) {
            drop(table);
            destroy_pin(ident, &entry.factory, entry.pin);
            let _ = sp.close(ident);
            return Err(Error::ShuttingDown);
        }
        if let Err(e) = sp.connect_addr(ident, addr, timeout, 0) {
            let entry = table.pins.remove(&ident);
            drop(table);
            if let Some(entry) = entry {
                destroy_pin(ident, &entry.factory, entry.pin);
            }
            let _ = sp.close(ident);
            return Err(e);
        }
        tracing::debug!(pin = %ident, %addr, "connecting");
        Ok(ident)
    }

    /// Bind a UDP pin. Arm it with `recv` and send with a destination.
    pub fn bind(
        &self,
        address: &str,
        port: u16,
        factory: Arc<dyn PinFactory>,
        arg: u64,
    ) -> Result<(Ident, SocketAddr)> {
        self.check_running()?;
        let sp = &self.shared.sp;
        let ident = sp.create(self.shared.link.clone(), SocketKind::Udp)?;
        let bound = sp
            .bind(ident, address, port)
            .and_then(|local| Ok((local, self.new_entry(ident, SocketKind::Udp, factory, arg)?)));
        match bound {
            Ok((local, entry)) => {
                let admitted = self.admit(&mut self.shared.table.lock(), ident, entry);
                if let Err(entry) = admitted {
                    destroy_pin(ident, &entry.factory, entry.pin);
                    let _ = sp.close(ident);
                    return Err(Error::ShuttingDown);
                }
                tracing::debug!(pin = %ident, %local, "bound");
                Ok((ident, local))
            }
            Err(e) => {
                let _ = sp.close(ident);
                Err(e)
            }
        }
    }

    // ── data path ──────────────────────────────────────────────────

    /// Queue `data` for sending. The bytes are copied. For UDP, `to` is
    /// required and `data` is one datagram.
    pub fn send(&self, ident: Ident, data: &[u8], to: Option<SocketAddr>) -> Result<usize> {
        self.send_bulk(ident, &[data], to)
    }

    /// Queue several buffers at once: one stream for TCP, one datagram
    /// per buffer for UDP. Either all are queued or none are. Running out
    /// of memory closes the pin with `SEND | NO_MEMORY`.
    pub fn send_bulk(&self, ident: Ident, bufs: &[&[u8]], to: Option<SocketAddr>) -> Result<usize> {
        let mut table = self.shared.table.lock();
        let entry = table.pins.get_mut(&ident).ok_or(Error::NotFound(ident))?;
        if entry.state != PinState::Live {
            return Err(Error::InvalidState("pin closing"));
        }
        let pushed = match entry.kind {
            SocketKind::Udp => {
                let to = to.ok_or(Error::NoDestination)?;
                entry.outbound.push_datagrams(bufs, to, &self.shared.pages)
            }
            _ => entry.outbound.push_stream(bufs, &self.shared.pages),
        };
        let queued = match pushed {
            Ok(n) => n,
            Err(Error::NoMemory) => {
                tracing::debug!(pin = %ident, "no memory for outbound pages");
                self.close_locked(&mut table, ident, ActionMask::SEND | ActionMask::NO_MEMORY);
                return Err(Error::NoMemory);
            }
            Err(e) => return Err(e),
        };
        if entry.in_progress.contains(ActionMask::SEND) {
            return Ok(queued);
        }
        let Some(next) = entry.outbound.next_send() else {
            return Ok(queued);
        };
        if let Err(e) = self.submit_send(ident, entry, next) {
            self.close_locked(&mut table, ident, ActionMask::SEND | call_reason(&e));
            return Err(e);
        }
        Ok(queued)
    }

    fn submit_send(&self, ident: Ident, entry: &mut PinEntry, send: PendingSend) -> Result<()> {
        self.shared
            .sp
            .send(ident, send.chunk, send.span, send.to, entry.send_timeout, 0)?;
        entry.in_progress.insert(ActionMask::SEND);
        Ok(())
    }

    /// Arm one receive. `expect_more` picks a full chunk over the
    /// leader probe (UDP always uses a full chunk). A receive that is
    /// already armed is left alone; from inside `on_recv` this asks for
    /// a re-arm when the callback returns. Running out of memory closes
    /// the pin with `RECV | NO_MEMORY`.
    pub fn recv(&self, ident: Ident, expect_more: bool) -> Result<()> {
        let mut table = self.shared.table.lock();
        let entry = table.pins.get_mut(&ident).ok_or(Error::NotFound(ident))?;
        if entry.state != PinState::Live {
            return Err(Error::InvalidState("pin closing"));
        }
        if entry.invoking.contains(ActionMask::RECV) {
            entry.rearm = Some(expect_more);
            return Ok(());
        }
        if entry.in_progress.contains(ActionMask::RECV) {
            return Ok(());
        }
        match self.arm_recv(ident, entry, expect_more) {
            Err(Error::NoMemory) => {
                tracing::debug!(pin = %ident, "no memory for inbound page");
                self.close_locked(&mut table, ident, ActionMask::RECV | ActionMask::NO_MEMORY);
                Err(Error::NoMemory)
            }
            other => other,
        }
    }

    fn arm_recv(&self, ident: Ident, entry: &mut PinEntry, expect_more: bool) -> Result<()> {
        let mut chunk = if expect_more || entry.kind == SocketKind::Udp {
            match entry.inbound.take() {
                Some(chunk) => chunk,
                None => self.shared.pages.alloc().ok_or(Error::NoMemory)?,
            }
        } else {
            entry.inbound = None;
            Chunk::detached(LEADER_SIZE)
        };
        chunk.reset();
        self.shared.sp.recv(ident, chunk, entry.recv_timeout, 0)?;
        entry.in_progress.insert(ActionMask::RECV);
        Ok(())
    }

    /// Close a pin (or a listener). Unsent bytes are discarded. Closing
    /// from inside the pin's own callback takes effect after it returns.
    /// Unknown or already closing idents are ignored.
    pub fn close(&self, ident: Ident) -> Result<()> {
        let mut table = self.shared.table.lock();
        if table.listeners.contains_key(&ident) {
            drop(table);
            return self.deaf(ident);
        }
        self.close_locked(&mut table, ident, ActionMask::USER);
        Ok(())
    }

    pub fn set_send_timeout(&self, ident: Ident, timeout: Option<Duration>) -> Result<()> {
        let mut table = self.shared.table.lock();
        let entry = table.pins.get_mut(&ident).ok_or(Error::NotFound(ident))?;
        entry.send_timeout = timeout;
        Ok(())
    }

    /// Applies to receives armed after this call.
    pub fn set_recv_timeout(&self, ident: Ident, timeout: Option<Duration>) -> Result<()> {
        let mut table = self.shared.table.lock();
        let entry = table.pins.get_mut(&ident).ok_or(Error::NotFound(ident))?;
        entry.recv_timeout = timeout;
        Ok(())
    }

    pub fn local_addr(&self, ident: Ident) -> Result<SocketAddr> {
        self.shared.sp.get_sock_addr(ident)
    }

    pub fn peer_addr(&self, ident: Ident) -> Result<SocketAddr> {
        self.shared.sp.get_peer_addr(ident)
    }

    /// Idents that are not (or no longer) pins report `Destroyed`.
    pub fn pin_state(&self, ident: Ident) -> PinState {
        let table = self.shared.table.lock();
        if let Some(entry) = table.pins.get(&ident) {
            return entry.state;
        }
        if table.finalizing.contains(&ident) || table.pending.iter().any(|(id, _)| *id == ident) {
            return PinState::PendingFinalClose;
        }
        PinState::Destroyed
    }

    // ── close protocol ─────────────────────────────────────────────

    /// Start closing a live pin. While one of its callbacks runs this
    /// only marks it; otherwise it goes straight to housekeeping.
    fn close_locked(&self, table: &mut Table, ident: Ident, mask: ActionMask) -> bool {
        let Some(entry) = table.pins.get_mut(&ident) else {
            return false;
        };
        if entry.state != PinState::Live {
            return false;
        }
        entry.close_mask = mask;
        if !entry.invoking.is_empty() {
            entry.state = PinState::ClosingDeferred;
            tracing::trace!(pin = %ident, %mask, "close deferred");
            return true;
        }
        self.retire(table, ident);
        true
    }

    /// Move a pin from the live map to the final-close queue.
    fn retire(&self, table: &mut Table, ident: Ident) {
        if let Some(mut entry) = table.pins.remove(&ident) {
            entry.state = PinState::PendingFinalClose;
            entry.deferred.clear();
            tracing::debug!(pin = %ident, mask = %entry.close_mask, "pin closing");
            table.pending.push_back((ident, entry));
            if let Some(t) = self.shared.housekeeper.lock().as_ref() {
                t.wakeup();
            }
        }
    }

    // ── callback sandwich ──────────────────────────────────────────

    /// Deliver `event`, or queue it if a callback is already running on
    /// this pin.
    fn dispatch(&self, mut table: MutexGuard<'_, Table>, ident: Ident, event: PinEvent) {
        let Some(entry) = table.pins.get_mut(&ident) else {
            return;
        };
        if entry.state != PinState::Live {
            return;
        }
        if !entry.invoking.is_empty() {
            entry.deferred.push_back(event);
            return;
        }
        self.trampoline(table, ident, event);
    }

    /// Run `event` and then every event queued behind it.
    fn trampoline(&self, mut table: MutexGuard<'_, Table>, ident: Ident, mut event: PinEvent) {
        loop {
            let Some(entry) = table.pins.get_mut(&ident) else {
                return;
            };
            let bit = event.bit();
            entry.invoking.insert(bit);
            let pin = entry.pin.clone();

            let outcome = MutexGuard::unlocked(&mut table, || self.invoke(&*pin, ident, &event));

            match self.epilogue(&mut table, ident, bit, event, outcome) {
                Some(next) => event = next,
                None => return,
            }
        }
    }

    /// Call user code. `None` if it panicked.
    fn invoke(&self, pin: &dyn Pin, ident: Ident, event: &PinEvent) -> Option<RecvAction> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match event {
            PinEvent::Accept { listener, peer } => {
                pin.on_accept(self, ident, *listener, *peer);
                RecvAction::STOP
            }
            PinEvent::Connect { peer } => {
                pin.on_connect(self, ident, *peer);
                RecvAction::STOP
            }
            PinEvent::Recv { chunk, from } => pin.on_recv(self, ident, chunk.filled(), *from),
            PinEvent::Sent => {
                pin.on_send(self, ident);
                RecvAction::STOP
            }
        }));
        match result {
            Ok(action) => Some(action),
            Err(_) => {
                tracing::error!(pin = %ident, callback = event.name(), "pin callback panicked");
                None
            }
        }
    }

    /// Second half of the sandwich. Returns the next queued event to run.
    fn epilogue(
        &self,
        table: &mut Table,
        ident: Ident,
        bit: ActionMask,
        event: PinEvent,
        outcome: Option<RecvAction>,
    ) -> Option<PinEvent> {
        let close = {
            let entry = table.pins.get_mut(&ident)?;
            entry.invoking.remove(bit);
            let rearm = entry.rearm.take();
            let mut close = None;
            if let PinEvent::Recv { chunk, .. } = event {
                entry.in_progress.remove(ActionMask::RECV);
                if chunk.is_pooled() {
                    entry.inbound = Some(chunk);
                }
                let want = match outcome {
                    Some(action) if action.keep_going => Some(action.expect_more),
                    Some(_) => rearm,
                    None => None,
                };
                if let (Some(expect_more), PinState::Live) = (want, entry.state) {
                    if let Err(e) = self.arm_recv(ident, entry, expect_more) {
                        tracing::debug!(pin = %ident, error = %e, "receive re-arm failed");
                        close = Some(ActionMask::RECV | call_reason(&e));
                    }
                }
            }
            if outcome.is_none() {
                close = Some(bit | ActionMask::ERROR);
            }
            close
        };
        if let Some(mask) = close {
            self.close_locked(table, ident, mask);
        }

        let entry = table.pins.get_mut(&ident)?;
        if !entry.invoking.is_empty() {
            return None;
        }
        if entry.state == PinState::ClosingDeferred {
            self.retire(table, ident);
            return None;
        }
        entry.deferred.pop_front()
    }

    // ── socket port completions ────────────────────────────────────

    fn accepted(&self, listener: Ident, ident: Ident, peer: SocketAddr) {
        let found = if self.shared.stopping.load(Ordering::Acquire) {
            None
        } else {
            self.shared
                .table
                .lock()
                .listeners
                .get(&listener)
                .map(|l| (l.factory.clone(), l.arg))
        };
        let Some((factory, arg)) = found else {
            let _ = self.shared.sp.close(ident);
            return;
        };
        match self.new_entry(ident, SocketKind::Tcp, factory, arg) {
            Ok(entry) => {
                let mut table = self.shared.table.lock();
                if let Err(entry) = self.admit(&mut table, ident, entry) {
                    drop(table);
                    tracing::debug!(%listener, %peer, "connection dropped during shutdown");
                    destroy_pin(ident, &entry.factory, entry.pin);
                    let _ = self.shared.sp.close(ident);
                    return;
                }
                tracing::trace!(pin = %ident, %listener, %peer, "accepted");
                self.dispatch(table, ident, PinEvent::Accept { listener, peer });
            }
            Err(e) => {
                tracing::debug!(%listener, %peer, error = %e, "connection dropped");
                let _ = self.shared.sp.close(ident);
            }
        }
    }

    fn connected(&self, ident: Ident, peer: SocketAddr) {
        let mut table = self.shared.table.lock();
        let Some(entry) = table.pins.get_mut(&ident) else {
            return;
        };
        entry.in_progress.remove(ActionMask::CONNECT);
        self.dispatch(table, ident, PinEvent::Connect { peer });
    }

    fn received(&self, ident: Ident, chunk: Chunk, bytes: usize, from: Option<SocketAddr>) {
        let mut table = self.shared.table.lock();
        let Some(entry) = table.pins.get_mut(&ident) else {
            return;
        };
        if entry.state != PinState::Live {
            entry.in_progress.remove(ActionMask::RECV);
            return;
        }
        if bytes == 0 && entry.kind == SocketKind::Tcp {
            entry.in_progress.remove(ActionMask::RECV);
            self.close_locked(&mut table, ident, ActionMask::RECV | ActionMask::PEER_CLOSED);
            return;
        }
        self.dispatch(table, ident, PinEvent::Recv { chunk, from });
    }

    fn sent(&self, ident: Ident, chunk: Chunk, bytes: usize) {
        let mut table = self.shared.table.lock();
        let Some(entry) = table.pins.get_mut(&ident) else {
            return;
        };
        if entry.state != PinState::Live {
            entry.in_progress.remove(ActionMask::SEND);
            return;
        }
        entry.outbound.complete(chunk, bytes);
        match entry.outbound.next_send() {
            Some(next) => {
                if let Err(e) = self.submit_send(ident, entry, next) {
                    tracing::debug!(pin = %ident, error = %e, "send resubmit failed");
                    self.close_locked(&mut table, ident, ActionMask::SEND | call_reason(&e));
                }
            }
            None => {
                entry.in_progress.remove(ActionMask::SEND);
                self.dispatch(table, ident, PinEvent::Sent);
            }
        }
    }

    fn failed(&self, ident: Ident, action: Action, error: OpError) {
        let mut table = self.shared.table.lock();
        let Some(entry) = table.pins.get_mut(&ident) else {
            tracing::trace!(socket = %ident, %action, %error, "completion after close");
            return;
        };
        let bit = action.mask_bit();
        entry.in_progress.remove(bit);
        tracing::debug!(pin = %ident, %action, %error, "operation failed");
        self.close_locked(&mut table, ident, bit | op_reason(error));
    }

    // ── diagnostics and shutdown ───────────────────────────────────

    /// Snapshot of pins, memory and threads; also logged at info level.
    pub fn doxray(&self) -> XRay {
        let mut x = XRay::default();
        {
            let table = self.shared.table.lock();
            for entry in table.pins.values() {
                match entry.state {
                    PinState::ClosingDeferred => x.closing_deferred += 1,
                    _ => x.live += 1,
                }
                x.outbound_bytes += entry.outbound.pending_bytes();
            }
            x.pending_close = table.pending.len() + table.finalizing.len();
            x.destroyed = table.destroyed;
            x.listeners = table.listeners.len();
        }
        let budget = self.budget();
        x.sockets = self.shared.sp.sockets();
        x.chunks_in_use = self.shared.pages.in_use();
        x.chunks_cached = self.shared.pages.cached();
        x.memory_in_use = budget.in_use();
        x.memory_budget = budget.limit();
        x.threads_total = self.shared.threads.total_threads();
        x.threads_borrowed = self.shared.threads.borrowed_threads();
        tracing::info!(
            live = x.live,
            closing_deferred = x.closing_deferred,
            pending_close = x.pending_close,
            destroyed = x.destroyed,
            listeners = x.listeners,
            chunks_in_use = x.chunks_in_use,
            memory_in_use = x.memory_in_use,
            memory_budget = x.memory_budget,
            "xray"
        );
        x
    }

    /// Close every listener and pin (`on_close` with `SHUTDOWN`), wait up
    /// to `shutdown_timeout` for final closes, then stop the socket port.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners: Vec<Ident> = self
            .shared
            .table
            .lock()
            .listeners
            .drain()
            .map(|(id, _)| id)
            .collect();
        for id in listeners {
            let _ = self.shared.sp.close(id);
        }
        {
            let mut table = self.shared.table.lock();
            let idents: Vec<Ident> = table.pins.keys().copied().collect();
            for id in idents {
                self.close_locked(&mut table, id, ActionMask::SHUTDOWN);
            }
        }

        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        loop {
            let busy = {
                let table = self.shared.table.lock();
                table.pins.len() + table.pending.len() + table.finalizing.len()
            };
            if busy == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(busy, "shutdown timed out waiting for pins");
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if let Some(t) = self.shared.housekeeper.lock().take() {
            t.release();
        }
        while let Some(item) = self.next_pending() {
            self.final_close(item);
        }
        self.shared.sp.shutdown();
        tracing::info!("gateway shut down");
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.shared.table.lock();
        f.debug_struct("Gateway")
            .field("pins", &table.pins.len())
            .field("listeners", &table.listeners.len())
            .field("pending_close", &table.pending.len())
            .finish()
    }
}

/// Socket-port callback shared by every gateway socket.
struct GatewayLink {
    shared: Weak<GatewayShared>,
}

impl GatewayLink {
    fn gateway(&self) -> Option<Gateway> {
        self.shared.upgrade().map(|shared| Gateway { shared })
    }
}

impl SocketCallback for GatewayLink {
    fn on_connect(&self, _: &SocketPort, ident: Ident, peer: SocketAddr, _: u64) {
        if let Some(gw) = self.gateway() {
            gw.connected(ident, peer);
        }
    }

    fn on_send(&self, _: &SocketPort, ident: Ident, chunk: Chunk, bytes: usize, _: u64) {
        if let Some(gw) = self.gateway() {
            gw.sent(ident, chunk, bytes);
        }
    }

    fn on_receive(
        &self,
        _: &SocketPort,
        ident: Ident,
        chunk: Chunk,
        bytes: usize,
        from: Option<SocketAddr>,
        _: u64,
    ) {
        if let Some(gw) = self.gateway() {
            gw.received(ident, chunk, bytes, from);
        }
    }

    fn on_accept(&self, sp: &SocketPort, listener: Ident, accepted: Ident, peer: SocketAddr, _: u64) {
        match self.gateway() {
            Some(gw) => gw.accepted(listener, accepted, peer),
            None => {
                let _ = sp.close(accepted);
            }
        }
    }

    fn on_error(
        &self,
        _: &SocketPort,
        ident: Ident,
        action: Action,
        error: OpError,
        _: Option<Chunk>,
        _: u64,
    ) {
        if let Some(gw) = self.gateway() {
            gw.failed(ident, action, error);
        }
    }
}
