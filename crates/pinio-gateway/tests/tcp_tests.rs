//! Gateway over TCP loopback.

mod common;

use common::{
    config, wait_for_condition, Behaviour, Harness, Note, OverlapFactory, ProbeFactory, DEADLINE,
};
use pinio_core::buffer::CHUNK_SIZE;
use pinio_gateway::{ActionMask, Error, Ident, PinState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn hello_reaches_the_server() {
    let h = Harness::new();
    let server = ProbeFactory::new(&h.log, Behaviour::reader());
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, s, c) = h.pair(&server, &client);

    assert_eq!(h.gw.send(c, b"hello", None).unwrap(), 5);
    h.log
        .wait_for("recv", |n| matches!(n, Note::Recv(id, _, _) if *id == s));
    assert_eq!(h.log.received(s), b"hello");
    h.log
        .wait_for("on_send", |n| matches!(n, Note::Sent(id) if *id == c));
    assert_eq!(h.gw.peer_addr(s).unwrap(), h.gw.local_addr(c).unwrap());
}

#[test]
fn leader_probe_delivers_every_byte() {
    let h = Harness::new();
    let server = ProbeFactory::new(
        &h.log,
        Behaviour {
            arm: true,
            expect_more: false,
            ..Behaviour::default()
        },
    );
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, s, c) = h.pair(&server, &client);

    let message = b"a message longer than the eight byte leader".to_vec();
    h.gw.send(c, &message, None).unwrap();
    wait_for_condition("full message", || h.log.received(s).len() >= message.len());
    assert_eq!(h.log.received(s), message);
}

#[test]
fn stream_arrives_in_call_order() {
    let h = Harness::new();
    let server = ProbeFactory::new(&h.log, Behaviour::reader());
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, s, c) = h.pair(&server, &client);

    let mut sent = Vec::new();
    for i in 0..200usize {
        let msg: Vec<u8> = (0..(i * 37) % 3000 + 1).map(|j| (i + j) as u8).collect();
        if i % 3 == 0 {
            let (a, b) = msg.split_at(msg.len() / 2);
            h.gw.send_bulk(c, &[a, b], None).unwrap();
        } else {
            h.gw.send(c, &msg, None).unwrap();
        }
        sent.extend_from_slice(&msg);
    }
    assert!(sent.len() > CHUNK_SIZE);

    wait_for_condition("whole stream", || h.log.received(s).len() >= sent.len());
    assert_eq!(h.log.received(s), sent);
}

#[test]
fn echo_roundtrip() {
    let h = Harness::new();
    let server = ProbeFactory::new(
        &h.log,
        Behaviour {
            echo: true,
            ..Behaviour::reader()
        },
    );
    let client = ProbeFactory::new(&h.log, Behaviour::reader());
    let (_listener, _s, c) = h.pair(&server, &client);

    h.gw.send(c, b"ping", None).unwrap();
    wait_for_condition("echo", || h.log.received(c) == b"ping");
}

#[test]
fn peer_close_during_on_recv_waits_for_it() {
    let h = Harness::new();
    let server = ProbeFactory::new(
        &h.log,
        Behaviour {
            recv_delay: Some(Duration::from_millis(300)),
            ..Behaviour::reader()
        },
    );
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, s, c) = h.pair(&server, &client);

    h.gw.send(c, b"x", None).unwrap();
    h.log
        .wait_for("on_recv entered", |n| matches!(n, Note::Recv(id, _, _) if *id == s));
    h.gw.close(c).unwrap();

    let mask = h.wait_closed(s);
    assert!(mask.contains(ActionMask::RECV | ActionMask::PEER_CLOSED), "{}", mask);
    let done = h
        .log
        .position(|n| matches!(n, Note::RecvDone(id) if *id == s))
        .unwrap();
    let closed = h
        .log
        .position(|n| matches!(n, Note::Close(id, _) if *id == s))
        .unwrap();
    assert!(done < closed);
    assert_eq!(h.wait_closed(c), ActionMask::USER);
}

#[test]
fn close_from_own_callback_is_deferred() {
    let h = Harness::new();
    let server = ProbeFactory::new(
        &h.log,
        Behaviour {
            close_in_recv: true,
            recv_delay: Some(Duration::from_millis(50)),
            ..Behaviour::reader()
        },
    );
    let client = ProbeFactory::new(&h.log, Behaviour::reader());
    let (_listener, s, c) = h.pair(&server, &client);

    h.gw.send(c, b"bye", None).unwrap();
    assert_eq!(h.wait_closed(s), ActionMask::USER);
    let done = h
        .log
        .position(|n| matches!(n, Note::RecvDone(id) if *id == s))
        .unwrap();
    let closed = h
        .log
        .position(|n| matches!(n, Note::Close(id, _) if *id == s))
        .unwrap();
    assert!(done < closed);

    wait_for_condition("server pin destroyed", || server.destroyed() == 1);
    assert_eq!(h.gw.pin_state(s), PinState::Destroyed);
    // The client sees the server go away.
    let mask = h.wait_closed(c);
    assert!(mask.contains(ActionMask::RECV), "{}", mask);
}

#[test]
fn receive_timeout_closes_the_pin() {
    let h = Harness::new();
    let server = ProbeFactory::new(
        &h.log,
        Behaviour {
            recv_timeout: Some(Duration::from_millis(100)),
            ..Behaviour::reader()
        },
    );
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, s, _c) = h.pair(&server, &client);

    let (accepted_at, _) = h
        .log
        .wait_for("accept", |n| matches!(n, Note::Accept(id) if *id == s));
    let (closed_at, note) = h
        .log
        .wait_for("timeout", |n| matches!(n, Note::Close(id, _) if *id == s));
    assert_eq!(note, Note::Close(s, ActionMask::RECV | ActionMask::TIMEOUT));
    let waited = closed_at - accepted_at;
    assert!(waited >= Duration::from_millis(90), "{:?}", waited);
    assert!(waited < Duration::from_millis(1000), "{:?}", waited);

    wait_for_condition("socket released", || {
        h.gw.socket_port().state(s).is_none()
    });
}

#[test]
fn close_is_idempotent() {
    let h = Harness::new();
    let server = ProbeFactory::new(&h.log, Behaviour::reader());
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, _s, c) = h.pair(&server, &client);

    h.gw.close(c).unwrap();
    h.gw.close(c).unwrap();
    h.gw.close(Ident::new(4242, 7)).unwrap();
    h.wait_closed(c);
    h.gw.close(c).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        h.log
            .count(|n| matches!(n, Note::Close(id, _) if *id == c)),
        1
    );
    assert!(matches!(h.gw.send(c, b"late", None), Err(Error::NotFound(_))));
    wait_for_condition("client destroyed", || client.destroyed() == 1);
}

#[test]
fn memory_budget_caps_sends() {
    let h = Harness::with_config(config().memory_budget(6 * CHUNK_SIZE));
    let server = ProbeFactory::new(&h.log, Behaviour::reader());
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, s, c) = h.pair(&server, &client);

    let big = vec![0u8; 7 * CHUNK_SIZE];
    assert!(matches!(h.gw.send(c, &big, None), Err(Error::NoMemory)));
    assert_eq!(h.wait_closed(c), ActionMask::SEND | ActionMask::NO_MEMORY);
    // Nothing of the rejected call reached the wire.
    let mask = h.wait_closed(s);
    assert!(mask.contains(ActionMask::RECV), "{}", mask);
    assert!(h.log.received(s).is_empty());

    let x = h.gw.doxray();
    assert!(x.memory_in_use <= x.memory_budget);
    assert_eq!(x.memory_budget, 6 * CHUNK_SIZE);
}

#[test]
fn receive_without_memory_closes_the_pin() {
    let h = Harness::with_config(config().memory_budget(8 * CHUNK_SIZE));
    let server = ProbeFactory::new(&h.log, Behaviour::default());
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, s, c) = h.pair(&server, &client);

    let budget = h.gw.budget().clone();
    let _hog = budget.try_reserve(budget.available()).unwrap();
    assert_eq!(budget.available(), 0);

    assert!(matches!(h.gw.recv(s, true), Err(Error::NoMemory)));
    assert_eq!(h.wait_closed(s), ActionMask::RECV | ActionMask::NO_MEMORY);
    assert!(matches!(h.gw.recv(s, true), Err(_)));

    // A leader probe needs no page.
    h.gw.recv(c, false).unwrap();
    let mask = h.wait_closed(c);
    assert!(mask.contains(ActionMask::RECV), "{}", mask);
}

#[test]
fn on_recv_never_overlaps_other_callbacks() {
    let h = Harness::new();
    let server = Arc::new(OverlapFactory::default());
    let client = ProbeFactory::new(&h.log, Behaviour::reader());
    let (_listener, addr) = h.gw.listen("127.0.0.1", 0, 10, 4, server.clone(), 0).unwrap();
    let c = h
        .gw
        .connect("127.0.0.1", addr.port(), client.clone(), 0, Some(DEADLINE))
        .unwrap();
    h.log
        .wait_for("connect", |n| matches!(n, Note::Connect(id) if *id == c));

    const WRITERS: usize = 4;
    const ROUNDS: usize = 50;
    let msg = [0x42u8; 100];
    thread::scope(|scope| {
        for _ in 0..WRITERS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    h.gw.send(c, &msg, None).unwrap();
                    thread::sleep(Duration::from_micros(300));
                }
            });
        }
    });

    let total = WRITERS * ROUNDS * msg.len();
    wait_for_condition("all echoed", || h.log.received(c).len() >= total);
    assert_eq!(h.log.received(c).len(), total);
    assert!(server.sends() > 0);
    assert_eq!(server.max_recv(), 1);
    assert_eq!(server.max_any(), 1);
}

#[test]
fn accepts_racing_shutdown_leave_no_pin_behind() {
    let h = Harness::new();
    let server = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, addr) = h.gw.listen("127.0.0.1", 0, 128, 8, server.clone(), 0).unwrap();

    let stop = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            let mut held = Vec::new();
            while !stop.load(Ordering::Relaxed) && held.len() < 200 {
                if let Ok(stream) = std::net::TcpStream::connect(addr) {
                    held.push(stream);
                }
                thread::sleep(Duration::from_millis(1));
            }
        });
        wait_for_condition("some accepts", || {
            h.log.count(|n| matches!(n, Note::Accept(_))) >= 5
        });
        h.gw.shutdown();
        stop.store(true, Ordering::Relaxed);
    });

    wait_for_condition("no pins left", || h.gw.doxray().pins() == 0);
    wait_for_condition("every pin destroyed", || {
        server.destroyed() == server.created.load(Ordering::SeqCst)
    });
    // Every pin that saw on_accept also saw on_close.
    wait_for_condition("on_close for every accept", || {
        h.log.count(|n| matches!(n, Note::Accept(_)))
            == h.log.count(|n| matches!(n, Note::Close(_, _)))
    });
}

#[test]
fn pin_stays_pending_until_destroyed() {
    let h = Harness::new();
    let server = ProbeFactory::new(&h.log, Behaviour::reader());
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, _s, c) = h.pair(&server, &client);

    h.gw.close(c).unwrap();
    h.wait_closed(c);
    let (_, seen) = h
        .log
        .wait_for("state in on_close", |n| matches!(n, Note::Closing(id, _) if *id == c));
    assert_eq!(seen, Note::Closing(c, PinState::PendingFinalClose));
    wait_for_condition("client destroyed", || client.destroyed() == 1);
    assert_eq!(h.gw.pin_state(c), PinState::Destroyed);
    assert_eq!(h.gw.doxray().pending_close, 0);
}

#[test]
fn panicking_callback_closes_only_its_pin() {
    let h = Harness::new();
    let server = ProbeFactory::new(
        &h.log,
        Behaviour {
            panic_in_recv: true,
            ..Behaviour::reader()
        },
    );
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let (_listener, s, c) = h.pair(&server, &client);

    h.gw.send(c, b"boom", None).unwrap();
    assert_eq!(h.wait_closed(s), ActionMask::RECV | ActionMask::ERROR);
    assert_eq!(h.log.count(|n| matches!(n, Note::RecvDone(_))), 0);
    // The gateway keeps serving.
    let x = h.gw.doxray();
    assert_eq!(x.listeners, 1);
}

#[test]
fn refused_connect_reports_connect_close() {
    let h = Harness::new();
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let client = ProbeFactory::new(&h.log, Behaviour::default());
    let c = h
        .gw
        .connect("127.0.0.1", port, client.clone(), 0, Some(Duration::from_secs(2)))
        .unwrap();
    let mask = h.wait_closed(c);
    assert!(mask.contains(ActionMask::CONNECT), "{}", mask);
    assert_eq!(h.log.count(|n| matches!(n, Note::Connect(_))), 0);
    wait_for_condition("client destroyed", || client.destroyed() == 1);
}

#[test]
fn deaf_stops_accepting() {
    let h = Harness::new();
    let server = ProbeFactory::new(&h.log, Behaviour::reader());
    let (listener, addr) = h.gw.listen("127.0.0.1", 0, 10, 2, server.clone(), 0).unwrap();
    assert_eq!(h.gw.doxray().listeners, 1);
    h.gw.deaf(listener).unwrap();
    assert!(matches!(h.gw.deaf(listener), Err(Error::NotFound(_))));
    assert_eq!(h.gw.doxray().listeners, 0);
    wait_for_condition("listener socket closed", || {
        std::net::TcpStream::connect(addr).is_err()
    });
}

#[test]
fn shutdown_closes_every_pin() {
    let h = Harness::new();
    let server = ProbeFactory::new(&h.log, Behaviour::reader());
    let client = ProbeFactory::new(&h.log, Behaviour::reader());
    let (_listener, s, c) = h.pair(&server, &client);
    let before = h.gw.doxray();
    assert_eq!(before.live, 2);
    assert_eq!(before.listeners, 1);

    h.gw.shutdown();
    for id in [s, c] {
        let mask = h.wait_closed(id);
        assert!(mask.contains(ActionMask::SHUTDOWN), "{}", mask);
    }
    let after = h.gw.doxray();
    assert_eq!(after.pins(), 0);
    assert_eq!(after.destroyed, 2);
    wait_for_condition("chunks released", || h.gw.doxray().chunks_in_use == 0);
    assert!(matches!(
        h.gw.listen("127.0.0.1", 0, 1, 1, server.clone(), 0),
        Err(Error::ShuttingDown)
    ));
}
