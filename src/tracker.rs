//! Connection accounting.
//!
//! Every outbound that wins a dispatch is wrapped in a tracker that counts
//! bytes into the shared [`Manager`] and registers itself for the lifetime of
//! the connection.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use futures::ready;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::adapter::{BoxStream, Chain, PacketConn};
use crate::metadata::Metadata;
use crate::rules::{self, Rule};

/// Per-connection counters shared between a tracker and the registry.
#[derive(Debug, Default)]
struct Traffic {
    upload: AtomicU64,
    download: AtomicU64,
}

struct Tracked {
    metadata: Metadata,
    chains: Chain,
    rule: Option<String>,
    start: Instant,
    traffic: Arc<Traffic>,
}

/// Point-in-time view of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub metadata: Metadata,
    pub chains: Chain,
    pub rule: Option<String>,
    pub upload: u64,
    pub download: u64,
    pub age_secs: u64,
}

/// Traffic since the previous [`Manager::snapshot_and_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub upload: u64,
    pub download: u64,
    pub active: usize,
}

/// Accounting sink for tracked connections.
pub struct Manager {
    upload_total: AtomicU64,
    download_total: AtomicU64,
    upload_blip: AtomicU64,
    download_blip: AtomicU64,
    next_id: AtomicU64,
    connections: RwLock<FxHashMap<u64, Tracked>>,
}

impl Manager {
    pub fn new() -> Self {
        Self {
            upload_total: AtomicU64::new(0),
            download_total: AtomicU64::new(0),
            upload_blip: AtomicU64::new(0),
            download_blip: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            connections: RwLock::new(FxHashMap::default()),
        }
    }

    fn join(&self, metadata: &Metadata, chains: Chain, rule: Option<&dyn Rule>) -> (u64, Arc<Traffic>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let traffic = Arc::new(Traffic::default());
        let tracked = Tracked {
            metadata: metadata.clone(),
            chains,
            rule: rule.map(rules::describe),
            start: Instant::now(),
            traffic: traffic.clone(),
        };
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tracked);
        (id, traffic)
    }

    fn leave(&self, id: u64) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn record_upload(&self, n: usize) {
        self.upload_total.fetch_add(n as u64, Ordering::Relaxed);
        self.upload_blip.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn record_download(&self, n: usize) {
        self.download_total.fetch_add(n as u64, Ordering::Relaxed);
        self.download_blip.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn upload_total(&self) -> u64 {
        self.upload_total.load(Ordering::Relaxed)
    }

    pub fn download_total(&self) -> u64 {
        self.download_total.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.connections
            .read()
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        let connections = self.connections.read().unwrap_or_else(PoisonError::into_inner);
        connections
            .iter()
            .map(|(id, tracked)| ConnectionSnapshot {
                id: *id,
                metadata: tracked.metadata.clone(),
                chains: tracked.chains.clone(),
                rule: tracked.rule.clone(),
                upload: tracked.traffic.upload.load(Ordering::Relaxed),
                download: tracked.traffic.download.load(Ordering::Relaxed),
                age_secs: tracked.start.elapsed().as_secs(),
            })
            .collect()
    }

    pub fn snapshot_and_reset(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            upload: self.upload_blip.swap(0, Ordering::Relaxed),
            download: self.download_blip.swap(0, Ordering::Relaxed),
            active: self.active(),
        }
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracked outbound stream. Writes count as upload, reads as download.
pub struct TcpTracker {
    id: u64,
    stream: BoxStream,
    chains: Chain,
    traffic: Arc<Traffic>,
    manager: Arc<Manager>,
}

impl TcpTracker {
    pub fn new(
        stream: BoxStream,
        manager: Arc<Manager>,
        metadata: &Metadata,
        chains: Chain,
        rule: Option<&dyn Rule>,
    ) -> Self {
        let (id, traffic) = manager.join(metadata, chains.clone(), rule);
        Self {
            id,
            stream,
            chains,
            traffic,
            manager,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn chains(&self) -> &Chain {
        &self.chains
    }
}

impl AsyncRead for TcpTracker {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.stream).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        self.traffic.download.fetch_add(n as u64, Ordering::Relaxed);
        self.manager.record_download(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TcpTracker {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut self.stream).poll_write(cx, buf))?;
        self.traffic.upload.fetch_add(n as u64, Ordering::Relaxed);
        self.manager.record_upload(n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Drop for TcpTracker {
    fn drop(&mut self) {
        self.manager.leave(self.id);
    }
}

/// Tracked outbound packet path.
pub struct UdpTracker {
    id: u64,
    conn: Box<dyn PacketConn>,
    chains: Chain,
    traffic: Arc<Traffic>,
    manager: Arc<Manager>,
}

impl UdpTracker {
    pub fn new(
        conn: Box<dyn PacketConn>,
        manager: Arc<Manager>,
        metadata: &Metadata,
        chains: Chain,
        rule: Option<&dyn Rule>,
    ) -> Self {
        let (id, traffic) = manager.join(metadata, chains.clone(), rule);
        Self {
            id,
            conn,
            chains,
            traffic,
            manager,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn chains(&self) -> &Chain {
        &self.chains
    }
}

#[async_trait]
impl PacketConn for UdpTracker {
    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let n = self.conn.write_to(buf, addr).await?;
        self.traffic.upload.fetch_add(n as u64, Ordering::Relaxed);
        self.manager.record_upload(n);
        Ok(n)
    }

    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.conn.read_from(buf).await?;
        self.traffic.download.fetch_add(n as u64, Ordering::Relaxed);
        self.manager.record_download(n);
        Ok((n, from))
    }
}

impl Drop for UdpTracker {
    fn drop(&mut self) {
        self.manager.leave(self.id);
    }
}
