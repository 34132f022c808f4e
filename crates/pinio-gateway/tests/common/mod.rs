//! Shared pins and harness for gateway integration tests.

#![allow(dead_code)]

use pinio_gateway::{
    ActionMask, Gateway, GatewayConfig, Ident, Pin, PinFactory, PinState, RecvAction,
};
use pinio_module::FixedPool;
use pinio_sockport::SocketPortConfig;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    Accept(Ident),
    Connect(Ident),
    Recv(Ident, Vec<u8>, Option<SocketAddr>),
    RecvDone(Ident),
    Sent(Ident),
    /// State the gateway reported from inside `on_close`.
    Closing(Ident, PinState),
    Close(Ident, ActionMask),
}

/// Everything the test pins saw, in order, with timestamps.
#[derive(Default)]
pub struct Log {
    notes: Mutex<Vec<(Instant, Note)>>,
    changed: Condvar,
}

impl Log {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, note: Note) {
        self.notes.lock().unwrap().push((Instant::now(), note));
        self.changed.notify_all();
    }

    pub fn snapshot(&self) -> Vec<(Instant, Note)> {
        self.notes.lock().unwrap().clone()
    }

    /// Wait until `pred` holds over the whole log; panics after
    /// [`DEADLINE`].
    pub fn wait_until(&self, what: &str, pred: impl Fn(&[(Instant, Note)]) -> bool) {
        let deadline = Instant::now() + DEADLINE;
        let mut notes = self.notes.lock().unwrap();
        while !pred(&notes) {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "timed out waiting for {}: {:?}", what, *notes);
            notes = self.changed.wait_timeout(notes, left).unwrap().0;
        }
    }

    /// First note matching `pred`, waiting for it.
    pub fn wait_for(&self, what: &str, pred: impl Fn(&Note) -> bool) -> (Instant, Note) {
        self.wait_until(what, |notes| notes.iter().any(|(_, n)| pred(n)));
        self.snapshot()
            .into_iter()
            .find(|(_, n)| pred(n))
            .unwrap()
    }

    pub fn count(&self, pred: impl Fn(&Note) -> bool) -> usize {
        self.snapshot().iter().filter(|(_, n)| pred(n)).count()
    }

    pub fn position(&self, pred: impl Fn(&Note) -> bool) -> Option<usize> {
        self.snapshot().iter().position(|(_, n)| pred(n))
    }

    /// All bytes `ident` received so far, concatenated.
    pub fn received(&self, ident: Ident) -> Vec<u8> {
        self.snapshot()
            .into_iter()
            .filter_map(|(_, n)| match n {
                Note::Recv(id, data, _) if id == ident => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// How a [`Probe`] pin behaves.
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    /// Arm a receive from `on_accept` / `on_connect`.
    pub arm: bool,
    pub expect_more: bool,
    pub recv_timeout: Option<Duration>,
    pub echo: bool,
    pub recv_delay: Option<Duration>,
    pub close_in_recv: bool,
    pub panic_in_recv: bool,
}

impl Behaviour {
    pub fn reader() -> Self {
        Self {
            arm: true,
            expect_more: true,
            ..Self::default()
        }
    }
}

pub struct Probe {
    log: Arc<Log>,
    how: Behaviour,
}

impl Probe {
    fn start(&self, gw: &Gateway, ident: Ident) {
        if let Some(t) = self.how.recv_timeout {
            gw.set_recv_timeout(ident, Some(t)).unwrap();
        }
        if self.how.arm {
            gw.recv(ident, self.how.expect_more).unwrap();
        }
    }
}

impl Pin for Probe {
    fn on_accept(&self, gw: &Gateway, ident: Ident, _listener: Ident, _peer: SocketAddr) {
        self.log.push(Note::Accept(ident));
        self.start(gw, ident);
    }

    fn on_connect(&self, gw: &Gateway, ident: Ident, _peer: SocketAddr) {
        self.log.push(Note::Connect(ident));
        self.start(gw, ident);
    }

    fn on_recv(
        &self,
        gw: &Gateway,
        ident: Ident,
        data: &[u8],
        from: Option<SocketAddr>,
    ) -> RecvAction {
        self.log.push(Note::Recv(ident, data.to_vec(), from));
        if self.how.panic_in_recv {
            panic!("pin failure");
        }
        if let Some(d) = self.how.recv_delay {
            thread::sleep(d);
        }
        if self.how.echo {
            gw.send(ident, data, from).unwrap();
        }
        if self.how.close_in_recv {
            gw.close(ident).unwrap();
        }
        self.log.push(Note::RecvDone(ident));
        RecvAction {
            keep_going: true,
            expect_more: self.how.expect_more,
        }
    }

    fn on_send(&self, _gw: &Gateway, ident: Ident) {
        self.log.push(Note::Sent(ident));
    }

    fn on_close(&self, gw: &Gateway, ident: Ident, mask: ActionMask) {
        self.log.push(Note::Closing(ident, gw.pin_state(ident)));
        self.log.push(Note::Close(ident, mask));
    }
}

pub struct ProbeFactory {
    log: Arc<Log>,
    how: Behaviour,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
}

impl ProbeFactory {
    pub fn new(log: &Arc<Log>, how: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            how,
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        })
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl PinFactory for ProbeFactory {
    fn create(&self, _ident: Ident, _arg: u64) -> Option<Arc<dyn Pin>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Some(Arc::new(Probe {
            log: self.log.clone(),
            how: self.how.clone(),
        }))
    }

    fn destroy(&self, pin: Arc<dyn Pin>) {
        drop(pin);
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Echo pin counting how many of its callbacks run at once.
#[derive(Default)]
pub struct Overlap {
    in_recv: AtomicUsize,
    in_any: AtomicUsize,
    pub max_recv: AtomicUsize,
    pub max_any: AtomicUsize,
    pub recvs: AtomicUsize,
    pub sends: AtomicUsize,
}

impl Overlap {
    fn enter(&self, recv: bool) {
        let any = self.in_any.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_any.fetch_max(any, Ordering::SeqCst);
        if recv {
            let n = self.in_recv.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_recv.fetch_max(n, Ordering::SeqCst);
        }
        // Widen the window for a second callback to slip in.
        thread::sleep(Duration::from_micros(200));
    }

    fn leave(&self, recv: bool) {
        if recv {
            self.in_recv.fetch_sub(1, Ordering::SeqCst);
        }
        self.in_any.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Pin for Overlap {
    fn on_accept(&self, gw: &Gateway, ident: Ident, _listener: Ident, _peer: SocketAddr) {
        self.enter(false);
        gw.recv(ident, true).unwrap();
        self.leave(false);
    }

    fn on_recv(
        &self,
        gw: &Gateway,
        ident: Ident,
        data: &[u8],
        from: Option<SocketAddr>,
    ) -> RecvAction {
        self.enter(true);
        self.recvs.fetch_add(1, Ordering::SeqCst);
        gw.send(ident, data, from).unwrap();
        self.leave(true);
        RecvAction::more()
    }

    fn on_send(&self, _gw: &Gateway, _ident: Ident) {
        self.enter(false);
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.leave(false);
    }
}

#[derive(Default)]
pub struct OverlapFactory {
    pub pins: Mutex<Vec<Arc<Overlap>>>,
}

impl OverlapFactory {
    pub fn max_recv(&self) -> usize {
        self.pins
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.max_recv.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    pub fn max_any(&self) -> usize {
        self.pins
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.max_any.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    pub fn sends(&self) -> usize {
        self.pins
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.sends.load(Ordering::SeqCst))
            .sum()
    }
}

impl PinFactory for OverlapFactory {
    fn create(&self, _ident: Ident, _arg: u64) -> Option<Arc<dyn Pin>> {
        let pin = Arc::new(Overlap::default());
        self.pins.lock().unwrap().push(pin.clone());
        Some(pin)
    }
}

pub struct Harness {
    pub gw: Gateway,
    pub log: Arc<Log>,
    _pool: Arc<FixedPool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let pool = Arc::new(FixedPool::new(config.threads_needed() + 1));
        let gw = Gateway::start(config, pool.clone()).unwrap();
        Self {
            gw,
            log: Log::new(),
            _pool: pool,
        }
    }

    /// Listen on loopback, connect one client; returns
    /// (listener, server pin, client pin).
    pub fn pair(
        &self,
        server: &Arc<ProbeFactory>,
        client: &Arc<ProbeFactory>,
    ) -> (Ident, Ident, Ident) {
        let (listener, addr) = self
            .gw
            .listen("0.0.0.0", 0, 10, 4, server.clone(), 0)
            .unwrap();
        let c = self
            .gw
            .connect("127.0.0.1", addr.port(), client.clone(), 0, Some(DEADLINE))
            .unwrap();
        self.log
            .wait_for("connect", |n| matches!(n, Note::Connect(id) if *id == c));
        let s = match self.log.wait_for("accept", |n| matches!(n, Note::Accept(_))).1 {
            Note::Accept(id) => id,
            _ => unreachable!(),
        };
        (listener, s, c)
    }

    pub fn wait_closed(&self, ident: Ident) -> ActionMask {
        match self
            .log
            .wait_for("close", |n| matches!(n, Note::Close(id, _) if *id == ident))
            .1
        {
            Note::Close(_, mask) => mask,
            _ => unreachable!(),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.gw.shutdown();
    }
}

pub fn config() -> GatewayConfig {
    GatewayConfig::new()
        .housekeeping_idle(Duration::from_millis(20))
        .shutdown_timeout(Duration::from_secs(1))
        .sockport(
            SocketPortConfig::new()
                .dispatch_threads(3)
                .poll_interval(Duration::from_millis(10))
                .sweep_interval(Duration::from_millis(10)),
        )
}

pub fn wait_for_condition(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}
