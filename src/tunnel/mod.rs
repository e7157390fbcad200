//! Dispatch engine.
//!
//! Inbounds push requests onto two bounded queues. A single loop drains the
//! TCP queue and races a routed dial against a forced direct dial per
//! connection; a pool of workers drains the UDP queue and funnels packets into
//! per-session outbound paths.

mod breaker;
mod route;
mod tcp;
mod udp;

pub use breaker::Breaker;
pub use route::GLOBAL;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::adapter::{Proxies, Providers};
use crate::inbound::{InboundConn, PacketAdapter};
use crate::nat::NatTable;
use crate::resolver::Dns;
use crate::rules::Rule;
use crate::tracker::Manager;

/// Capacity of each inbound queue.
pub const QUEUE_CAPACITY: usize = 200;

/// Idle period after which a UDP session is torn down.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Routed failures in a row before direct dials join the race.
pub const BREAKER_THRESHOLD: u32 = 3;

/// How requests pick their outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelMode {
    #[default]
    Rule,
    Global,
    Direct,
}

impl TunnelMode {
    fn as_u8(self) -> u8 {
        match self {
            TunnelMode::Rule => 0,
            TunnelMode::Global => 1,
            TunnelMode::Direct => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => TunnelMode::Global,
            2 => TunnelMode::Direct,
            _ => TunnelMode::Rule,
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TunnelMode::Rule => "Rule",
            TunnelMode::Global => "Global",
            TunnelMode::Direct => "Direct",
        })
    }
}

impl FromStr for TunnelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rule" => Ok(TunnelMode::Rule),
            "global" => Ok(TunnelMode::Global),
            "direct" => Ok(TunnelMode::Direct),
            _ => Err(format!("unknown mode {s}")),
        }
    }
}

/// Engine knobs.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub mode: TunnelMode,
    pub queue_capacity: usize,
    pub udp_workers: usize,
    pub udp_timeout: Duration,
    pub breaker_threshold: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            mode: TunnelMode::Rule,
            queue_capacity: QUEUE_CAPACITY,
            udp_workers: cpus.max(4),
            udp_timeout: UDP_TIMEOUT,
            breaker_threshold: BREAKER_THRESHOLD,
        }
    }
}

/// Rules, proxies and providers as one immutable unit.
#[derive(Clone, Default)]
pub(crate) struct Routing {
    pub(crate) rules: Arc<Vec<Arc<dyn Rule>>>,
    pub(crate) proxies: Arc<Proxies>,
    pub(crate) providers: Arc<Providers>,
}

type Queues = (mpsc::Receiver<InboundConn>, mpsc::Receiver<PacketAdapter>);

/// The dispatch engine.
pub struct Tunnel {
    routing: RwLock<Routing>,
    mode: AtomicU8,
    dns: Arc<Dns>,
    nat: NatTable,
    manager: Arc<Manager>,
    breaker: Breaker,
    udp_workers: usize,
    udp_timeout: Duration,
    tcp_queue: mpsc::Sender<InboundConn>,
    udp_queue: mpsc::Sender<PacketAdapter>,
    queues: Mutex<Option<Queues>>,
}

impl Tunnel {
    pub fn new(config: TunnelConfig, dns: Arc<Dns>, manager: Arc<Manager>) -> Arc<Self> {
        let capacity = config.queue_capacity.max(1);
        let (tcp_queue, tcp_rx) = mpsc::channel(capacity);
        let (udp_queue, udp_rx) = mpsc::channel(capacity);

        Arc::new(Self {
            routing: RwLock::new(Routing::default()),
            mode: AtomicU8::new(config.mode.as_u8()),
            dns,
            nat: NatTable::new(),
            manager,
            breaker: Breaker::new(config.breaker_threshold),
            udp_workers: config.udp_workers.max(1),
            udp_timeout: config.udp_timeout,
            tcp_queue,
            udp_queue,
            queues: Mutex::new(Some((tcp_rx, udp_rx))),
        })
    }

    /// Spawn the TCP dispatch loop and the UDP workers. Later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((tcp_rx, udp_rx)) = queues else {
            warn!("tunnel already started");
            return;
        };

        tokio::spawn(tcp::run_dispatch_loop(self.clone(), tcp_rx));
        udp::spawn_workers(self.clone(), udp_rx, self.udp_workers);
        debug!(workers = self.udp_workers, "tunnel started");
    }

    /// Queue a TCP request, waiting while the queue is full.
    pub async fn add(&self, conn: InboundConn) {
        if self.tcp_queue.send(conn).await.is_err() {
            warn!("[TCP] dispatch loop is gone, dropping connection");
        }
    }

    /// Queue a UDP packet. A full queue drops it.
    pub fn add_packet(&self, packet: PacketAdapter) {
        if let Err(TrySendError::Closed(_)) = self.udp_queue.try_send(packet) {
            warn!("[UDP] workers are gone, dropping packet");
        }
    }

    pub(crate) fn routing(&self) -> Routing {
        self.routing.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn rules(&self) -> Arc<Vec<Arc<dyn Rule>>> {
        self.routing().rules
    }

    pub fn update_rules(&self, rules: Vec<Arc<dyn Rule>>) {
        self.routing.write().unwrap_or_else(PoisonError::into_inner).rules = Arc::new(rules);
    }

    pub fn proxies(&self) -> Arc<Proxies> {
        self.routing().proxies
    }

    pub fn providers(&self) -> Arc<Providers> {
        self.routing().providers
    }

    pub fn update_proxies(&self, proxies: Proxies, providers: Providers) {
        let mut routing = self.routing.write().unwrap_or_else(PoisonError::into_inner);
        routing.proxies = Arc::new(proxies);
        routing.providers = Arc::new(providers);
    }

    pub fn mode(&self) -> TunnelMode {
        TunnelMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    pub fn set_mode(&self, mode: TunnelMode) {
        self.mode.store(mode.as_u8(), Ordering::Relaxed);
    }

    pub fn dns(&self) -> &Arc<Dns> {
        &self.dns
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Current count of consecutive routed-dial failures.
    pub fn failed_dials(&self) -> u32 {
        self.breaker.failures()
    }
}
