//! Socket port over real loopback sockets.

use pinio_core::buffer::Chunk;
use pinio_core::entry::{Action, SocketKind};
use pinio_core::error::{Error, OpError};
use pinio_core::ident::Ident;
use pinio_module::FixedPool;
use pinio_sockport::{SocketCallback, SocketPort, SocketPortConfig, SocketState};

use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
enum Event {
    Connect(Ident),
    Accept { listener: Ident, accepted: Ident },
    Receive { ident: Ident, data: Vec<u8>, from: Option<SocketAddr> },
    Send { ident: Ident, bytes: usize },
    Error { ident: Ident, action: Action, error: OpError },
}

struct Recorder(Mutex<Sender<Event>>);

impl Recorder {
    fn push(&self, event: Event) {
        let _ = self.0.lock().unwrap().send(event);
    }
}

impl SocketCallback for Recorder {
    fn on_connect(&self, _: &SocketPort, ident: Ident, _: SocketAddr, _: u64) {
        self.push(Event::Connect(ident));
    }

    fn on_send(&self, _: &SocketPort, ident: Ident, _: Chunk, bytes: usize, _: u64) {
        self.push(Event::Send { ident, bytes });
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
        let filled = chunk.filled();
        let data = filled[filled.len() - bytes..].to_vec();
        self.push(Event::Receive { ident, data, from });
    }

    fn on_accept(&self, _: &SocketPort, listener: Ident, accepted: Ident, _: SocketAddr, _: u64) {
        self.push(Event::Accept { listener, accepted });
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
        self.push(Event::Error { ident, action, error });
    }
}

struct Harness {
    sp: SocketPort,
    cb: Arc<Recorder>,
    rx: Receiver<Event>,
    backlog: Vec<Event>,
    _pool: Arc<FixedPool>,
}

impl Harness {
    fn new() -> Self {
        let pool = Arc::new(FixedPool::new(4));
        let config = SocketPortConfig::new()
            .dispatch_threads(2)
            .poll_interval(Duration::from_millis(10))
            .sweep_interval(Duration::from_millis(10));
        let sp = SocketPort::start(config, pool.clone()).unwrap();
        let (tx, rx) = channel();
        Self {
            sp,
            cb: Arc::new(Recorder(Mutex::new(tx))),
            rx,
            backlog: Vec::new(),
            _pool: pool,
        }
    }

    fn socket(&self, kind: SocketKind) -> Ident {
        self.sp.create(self.cb.clone(), kind).unwrap()
    }

    /// Next event matching `pred`; unrelated events are kept for later.
    fn expect(&mut self, pred: impl Fn(&Event) -> bool) -> Event {
        if let Some(i) = self.backlog.iter().position(&pred) {
            return self.backlog.remove(i);
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(event) if pred(&event) => return event,
                Ok(event) => self.backlog.push(event),
                Err(_) => panic!("event not seen; backlog: {:?}", self.backlog),
            }
        }
    }

    /// Listener plus one connected client; returns (listener, client, accepted).
    fn connected_pair(&mut self) -> (Ident, Ident, Ident) {
        let listener = self.socket(SocketKind::Tcp);
        let addr = self.sp.listen(listener, 0, 16, "127.0.0.1", 2, 0).unwrap();
        let client = self.socket(SocketKind::Tcp);
        self.sp
            .connect(client, "127.0.0.1", addr.port(), Some(Duration::from_secs(2)), 0)
            .unwrap();
        self.expect(|e| matches!(e, Event::Connect(id) if *id == client));
        let accepted = match self.expect(|e| matches!(e, Event::Accept { .. })) {
            Event::Accept { accepted, .. } => accepted,
            _ => unreachable!(),
        };
        (listener, client, accepted)
    }

    fn wait_closed(&self, ident: Ident) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.sp.state(ident).is_some() {
            assert!(Instant::now() < deadline, "{} never closed", ident);
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.sp.shutdown();
    }
}

fn payload(bytes: &[u8]) -> Chunk {
    let mut chunk = Chunk::detached(1024);
    chunk.append(bytes);
    chunk
}

#[test]
fn tcp_connect_accept_send_receive() {
    let mut h = Harness::new();
    let (_listener, client, accepted) = h.connected_pair();
    assert_eq!(h.sp.state(accepted), Some(SocketState::Idle));
    assert_eq!(
        h.sp.get_peer_addr(accepted).unwrap(),
        h.sp.get_sock_addr(client).unwrap()
    );

    h.sp.recv(accepted, Chunk::detached(1024), None, 0).unwrap();
    let chunk = payload(b"ping");
    let span = chunk.begin()..chunk.end();
    h.sp.send(client, chunk, span, None, None, 0).unwrap();

    match h.expect(|e| matches!(e, Event::Send { ident, .. } if *ident == client)) {
        Event::Send { bytes, .. } => assert_eq!(bytes, 4),
        _ => unreachable!(),
    }
    match h.expect(|e| matches!(e, Event::Receive { ident, .. } if *ident == accepted)) {
        Event::Receive { data, from, .. } => {
            assert_eq!(data, b"ping");
            assert!(from.is_none());
        }
        _ => unreachable!(),
    }

    h.sp.close(client).unwrap();
    h.sp.close(accepted).unwrap();
    h.wait_closed(client);
    h.wait_closed(accepted);
}

#[test]
fn recv_timeout_reports_timed_out() {
    let mut h = Harness::new();
    let (_listener, client, _accepted) = h.connected_pair();
    let started = Instant::now();
    h.sp.recv(client, Chunk::detached(64), Some(Duration::from_millis(50)), 0)
        .unwrap();
    match h.expect(|e| matches!(e, Event::Error { ident, .. } if *ident == client)) {
        Event::Error { action, error, .. } => {
            assert_eq!(action, Action::Recv);
            assert_eq!(error, OpError::TimedOut);
        }
        _ => unreachable!(),
    }
    assert!(started.elapsed() >= Duration::from_millis(50));
    // The socket survives a timed-out receive.
    assert_eq!(h.sp.state(client), Some(SocketState::Idle));
}

#[test]
fn close_cancels_outstanding_receive() {
    let mut h = Harness::new();
    let (_listener, _client, accepted) = h.connected_pair();
    h.sp.recv(accepted, Chunk::detached(64), None, 0).unwrap();
    assert_eq!(h.sp.state(accepted), Some(SocketState::InFlight));

    h.sp.close(accepted).unwrap();
    h.sp.close(accepted).unwrap();
    match h.expect(|e| matches!(e, Event::Error { ident, .. } if *ident == accepted)) {
        Event::Error { action, error, .. } => {
            assert_eq!(action, Action::Recv);
            assert_eq!(error, OpError::Cancelled);
        }
        _ => unreachable!(),
    }
    h.wait_closed(accepted);
    assert!(matches!(
        h.sp.recv(accepted, Chunk::detached(64), None, 0),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn accept_pool_is_replenished() {
    let mut h = Harness::new();
    let listener = h.socket(SocketKind::Tcp);
    let addr = h.sp.listen(listener, 0, 16, "127.0.0.1", 1, 0).unwrap();
    let clients: Vec<_> = (0..3)
        .map(|_| std::net::TcpStream::connect(addr).unwrap())
        .collect();
    for _ in &clients {
        h.expect(|e| matches!(e, Event::Accept { listener: l, .. } if *l == listener));
    }
}

#[test]
fn udp_send_to_and_receive_from() {
    let mut h = Harness::new();
    let a = h.socket(SocketKind::Udp);
    let b = h.socket(SocketKind::Udp);
    let a_addr = h.sp.bind(a, "127.0.0.1", 0).unwrap();
    let b_addr = h.sp.bind(b, "127.0.0.1", 0).unwrap();

    h.sp.recv(b, Chunk::detached(512), None, 0).unwrap();
    let chunk = payload(b"datagram");
    let span = chunk.begin()..chunk.end();
    h.sp.send(a, chunk, span, Some(b_addr), None, 0).unwrap();

    match h.expect(|e| matches!(e, Event::Receive { ident, .. } if *ident == b)) {
        Event::Receive { data, from, .. } => {
            assert_eq!(data, b"datagram");
            assert_eq!(from, Some(a_addr));
        }
        _ => unreachable!(),
    }
}

#[test]
fn connect_refused_reports_error() {
    let mut h = Harness::new();
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let client = h.socket(SocketKind::Tcp);
    h.sp.connect(client, "127.0.0.1", port, Some(Duration::from_secs(2)), 0)
        .unwrap();
    match h.expect(|e| matches!(e, Event::Error { ident, .. } if *ident == client)) {
        Event::Error { action, error, .. } => {
            assert_eq!(action, Action::Connect);
            assert!(matches!(error, OpError::Os(_)), "got {:?}", error);
        }
        _ => unreachable!(),
    }
}

#[test]
fn misuse_is_rejected() {
    let h = Harness::new();
    let udp = h.socket(SocketKind::Udp);
    assert!(matches!(
        h.sp.listen(udp, 0, 1, "127.0.0.1", 1, 0),
        Err(Error::InvalidState(_))
    ));
    let tcp = h.socket(SocketKind::Tcp);
    assert!(matches!(
        h.sp.send(tcp, payload(b"x"), 0..1, None, None, 0),
        Err(Error::InvalidState(_))
    ));
    assert!(h.sp.create(h.cb.clone(), SocketKind::File).is_err());
    // Unknown and already-closed sockets close quietly.
    h.sp.close(tcp).unwrap();
    h.sp.close(tcp).unwrap();
}

#[test]
fn shutdown_rejects_new_sockets() {
    let h = Harness::new();
    let listener = h.socket(SocketKind::Tcp);
    h.sp.listen(listener, 0, 4, "127.0.0.1", 2, 0).unwrap();
    h.sp.shutdown();
    assert_eq!(h.sp.sockets(), 0);
    assert!(matches!(
        h.sp.create(h.cb.clone(), SocketKind::Tcp),
        Err(Error::ShuttingDown)
    ));
}
