#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use waypoint::adapter::{BoxStream, PacketConn, Proxies, Providers, Proxy};
use waypoint::inbound::UdpPacket;
use waypoint::metadata::Metadata;
use waypoint::resolver::Dns;
use waypoint::tracker::Manager;
use waypoint::tunnel::{Tunnel, TunnelConfig, TunnelMode};

/// Outbound whose dials can be switched between success and failure.
///
/// Successful TCP dials hand the far end of an in-memory pipe to the test.
pub struct MockProxy {
    name: String,
    failing: AtomicBool,
    delay: Duration,
    tcp_dials: AtomicUsize,
    udp_dials: AtomicUsize,
    remotes: mpsc::UnboundedSender<DuplexStream>,
    pub packets: Arc<PacketState>,
}

impl MockProxy {
    pub fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        Self::with_delay(name, Duration::ZERO)
    }

    pub fn with_delay(name: &str, delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        let proxy = Arc::new(Self {
            name: name.to_string(),
            failing: AtomicBool::new(false),
            delay,
            tcp_dials: AtomicUsize::new(0),
            udp_dials: AtomicUsize::new(0),
            remotes,
            packets: Arc::new(PacketState::new()),
        });
        (proxy, rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn tcp_dials(&self) -> usize {
        self.tcp_dials.load(Ordering::SeqCst)
    }

    pub fn udp_dials(&self) -> usize {
        self.udp_dials.load(Ordering::SeqCst)
    }

    async fn wait(&self) -> io::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl Proxy for MockProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial(&self, _metadata: &Metadata) -> io::Result<BoxStream> {
        self.tcp_dials.fetch_add(1, Ordering::SeqCst);
        self.wait().await?;
        let (near, far) = tokio::io::duplex(1024);
        let _ = self.remotes.send(far);
        Ok(Box::new(near))
    }

    async fn dial_udp(&self, _metadata: &Metadata) -> io::Result<Box<dyn PacketConn>> {
        self.udp_dials.fetch_add(1, Ordering::SeqCst);
        self.wait().await?;
        Ok(Box::new(MockPacketConn {
            state: self.packets.clone(),
        }))
    }
}

type Datagram = (Vec<u8>, SocketAddr);

/// Shared record of what went through the mock packet connections.
pub struct PacketState {
    writes: Mutex<Vec<Datagram>>,
    reply_tx: mpsc::UnboundedSender<Datagram>,
    reply_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl PacketState {
    fn new() -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            writes: Mutex::new(Vec::new()),
            reply_tx,
            reply_rx: tokio::sync::Mutex::new(reply_rx),
        }
    }

    pub fn writes(&self) -> Vec<Datagram> {
        self.writes.lock().unwrap().clone()
    }

    /// Queue a datagram for the outbound side to "receive".
    pub fn reply(&self, data: &[u8], from: SocketAddr) {
        self.reply_tx.send((data.to_vec(), from)).unwrap();
    }
}

struct MockPacketConn {
    state: Arc<PacketState>,
}

#[async_trait]
impl PacketConn for MockPacketConn {
    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.state.writes.lock().unwrap().push((buf.to_vec(), addr));
        Ok(buf.len())
    }

    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.state.reply_rx.lock().await;
        match rx.recv().await {
            Some((data, from)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), from))
            }
            None => std::future::pending().await,
        }
    }
}

/// Inbound datagram whose replies land on a channel.
pub struct MockPacket {
    data: Vec<u8>,
    local: SocketAddr,
    replies: mpsc::UnboundedSender<Datagram>,
}

impl MockPacket {
    pub fn new(data: &[u8], local: SocketAddr, replies: mpsc::UnboundedSender<Datagram>) -> Arc<Self> {
        Arc::new(Self {
            data: data.to_vec(),
            local,
            replies,
        })
    }
}

#[async_trait]
impl UdpPacket for MockPacket {
    fn data(&self) -> &[u8] {
        &self.data
    }

    async fn write_back(&self, buf: &[u8], from: SocketAddr) -> io::Result<usize> {
        let _ = self.replies.send((buf.to_vec(), from));
        Ok(buf.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

pub fn config(mode: TunnelMode) -> TunnelConfig {
    TunnelConfig {
        mode,
        udp_workers: 4,
        ..TunnelConfig::default()
    }
}

/// Tunnel routing over `proxies`, queues not yet drained.
pub fn idle_tunnel(config: TunnelConfig, dns: Arc<Dns>, proxies: Vec<Arc<dyn Proxy>>) -> Arc<Tunnel> {
    let tunnel = Tunnel::new(config, dns, Arc::new(Manager::new()));
    let mut table = Proxies::default();
    for proxy in proxies {
        table.insert(proxy.name().to_string(), proxy);
    }
    tunnel.update_proxies(table, Providers::default());
    tunnel
}

/// Started tunnel routing over `proxies`.
pub fn tunnel(config: TunnelConfig, dns: Arc<Dns>, proxies: Vec<Arc<dyn Proxy>>) -> Arc<Tunnel> {
    let tunnel = idle_tunnel(config, dns, proxies);
    tunnel.start();
    tunnel
}

/// Poll `check` for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
