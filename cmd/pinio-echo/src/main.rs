//! pinio Echo Server
//!
//! Echoes every byte (TCP) or datagram (UDP) back to its sender through
//! the pin gateway. Each connection is a pin; the gateway closes it when
//! the peer goes away.
//!
//! Usage:
//!     cargo build --release -p pinio-echo
//!     ./target/release/pinio-echo [port] [tcp|udp] [seconds]
//!
//! `seconds` = 0 (default) runs until killed. Gateway and socket port
//! knobs come from `PINIO_*` environment variables; log level from
//! `RUST_LOG` or `PINIO_LOG`.
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!     echo "hello" | nc -u -q1 localhost 9999
//!
//!     # Many at once:
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q1 localhost 9999 & done

use pinio_core::ident::Ident;
use pinio_core::mask::ActionMask;
use pinio_core::pool::ThreadPool;
use pinio_gateway::{Gateway, GatewayConfig, Pin, PinFactory, RecvAction};
use pinio_module::FixedPool;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 9999;
const REPORT_EVERY: Duration = Duration::from_secs(5);

// ── Counters ──

#[derive(Default)]
struct Stats {
    opened: AtomicU64,
    closed: AtomicU64,
    bytes: AtomicU64,
}

// ── Echo pin ──

struct Echo {
    stats: Arc<Stats>,
}

impl Pin for Echo {
    fn on_accept(&self, gw: &Gateway, ident: Ident, _listener: Ident, peer: SocketAddr) {
        tracing::debug!(pin = %ident, %peer, "accepted");
        if let Err(e) = gw.recv(ident, false) {
            tracing::warn!(pin = %ident, error = %e, "recv failed");
            let _ = gw.close(ident);
        }
    }

    fn on_recv(
        &self,
        gw: &Gateway,
        ident: Ident,
        data: &[u8],
        from: Option<SocketAddr>,
    ) -> RecvAction {
        self.stats.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        match gw.send(ident, data, from) {
            Ok(_) => RecvAction::more(),
            Err(e) => {
                tracing::warn!(pin = %ident, error = %e, "echo failed");
                // UDP pins serve every peer; one bad send does not end them.
                if from.is_some() {
                    RecvAction::more()
                } else {
                    let _ = gw.close(ident);
                    RecvAction::STOP
                }
            }
        }
    }

    fn on_close(&self, _gw: &Gateway, ident: Ident, mask: ActionMask) {
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pin = %ident, %mask, "closed");
    }
}

struct EchoFactory {
    stats: Arc<Stats>,
}

impl PinFactory for EchoFactory {
    fn create(&self, _ident: Ident, _arg: u64) -> Option<Arc<dyn Pin>> {
        self.stats.opened.fetch_add(1, Ordering::Relaxed);
        Some(Arc::new(Echo {
            stats: Arc::clone(&self.stats),
        }))
    }
}

// ── Setup ──

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("PINIO_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let udp = args.get(2).is_some_and(|s| s.eq_ignore_ascii_case("udp"));
    let seconds: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);

    let config = GatewayConfig::from_env();
    config.print();

    let mut pool = Arc::new(FixedPool::auto_sized());
    if pool.total_threads() < config.threads_needed() {
        pool = Arc::new(FixedPool::new(config.threads_needed()));
    }

    let gw = match Gateway::start(config, pool.clone()) {
        Ok(gw) => gw,
        Err(e) => {
            tracing::error!(error = %e, "gateway start failed");
            std::process::exit(1);
        }
    };

    let stats = Arc::new(Stats::default());
    let factory: Arc<dyn PinFactory> = Arc::new(EchoFactory {
        stats: Arc::clone(&stats),
    });

    let opened = if udp {
        gw.bind("0.0.0.0", port, factory, 0)
            .and_then(|(ident, local)| gw.recv(ident, true).map(|_| local))
    } else {
        let accept_pool = gw.config().sockport.accept_pool;
        let backlog = gw.config().sockport.backlog;
        gw.listen("0.0.0.0", port, backlog, accept_pool, factory, 0)
            .map(|(_, local)| local)
    };
    match opened {
        Ok(local) => {
            let proto = if udp { "udp" } else { "tcp" };
            tracing::info!(%local, proto, "echo server ready");
        }
        Err(e) => {
            tracing::error!(port, error = %e, "cannot open echo socket");
            gw.shutdown();
            pool.shutdown();
            std::process::exit(1);
        }
    }

    // ── Run ──

    let started = Instant::now();
    loop {
        let wait = match seconds {
            0 => REPORT_EVERY,
            s => {
                let left = Duration::from_secs(s).saturating_sub(started.elapsed());
                if left.is_zero() {
                    break;
                }
                left.min(REPORT_EVERY)
            }
        };
        std::thread::sleep(wait);
        let xray = gw.doxray();
        tracing::info!(
            opened = stats.opened.load(Ordering::Relaxed),
            closed = stats.closed.load(Ordering::Relaxed),
            bytes = stats.bytes.load(Ordering::Relaxed),
            pins = xray.pins(),
            "echo stats"
        );
    }

    gw.shutdown();
    pool.shutdown();
    tracing::info!(
        bytes = stats.bytes.load(Ordering::Relaxed),
        "echo server stopped"
    );
}
