//! UDP dispatch: per-session outbound paths created once per local address.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout_at;
use tracing::{debug, warn};

use super::Tunnel;
use crate::adapter::{Direct, PacketConn};
use crate::error::{Error, Result};
use crate::inbound::{MAX_PACKET_SIZE, PacketAdapter, UdpPacket};
use crate::metadata::Metadata;
use crate::nat::{Session, SessionLock};
use crate::rules::describe;
use crate::tracker::UdpTracker;

pub(super) fn spawn_workers(tunnel: Arc<Tunnel>, queue: mpsc::Receiver<PacketAdapter>, workers: usize) {
    let queue = Arc::new(Mutex::new(queue));
    for _ in 0..workers {
        tokio::spawn(run_worker(tunnel.clone(), queue.clone()));
    }
}

async fn run_worker(tunnel: Arc<Tunnel>, queue: Arc<Mutex<mpsc::Receiver<PacketAdapter>>>) {
    loop {
        let packet = queue.lock().await.recv().await;
        match packet {
            Some(packet) => handle_udp_conn(&tunnel, packet).await,
            None => break,
        }
    }
}

async fn handle_udp_conn(tunnel: &Arc<Tunnel>, packet: PacketAdapter) {
    let (packet, mut metadata) = packet.into_parts();
    if !metadata.valid() {
        warn!("[Metadata] not valid: {:?}", metadata);
        return;
    }

    // Replies to a fake destination must come from the fake address.
    let fake_addr = match metadata.dst_ip {
        Some(ip) if tunnel.dns.is_exist_fake_ip(ip) => metadata.udp_addr(),
        _ => None,
    };

    if let Err(e) = tunnel.pre_handle_metadata(&mut metadata) {
        debug!("[Metadata PreHandle] error: {}", e);
        return;
    }

    let key = packet.local_addr().to_string();
    if let Some(session) = tunnel.nat.get(&key) {
        forward(tunnel, packet.as_ref(), &session, &mut metadata).await;
        return;
    }

    let (lock, loaded) = tunnel.nat.get_or_create_lock(&key);
    let tunnel = tunnel.clone();
    tokio::spawn(async move {
        if loaded {
            lock.wait().await;
            if let Some(session) = tunnel.nat.get(&key) {
                forward(&tunnel, packet.as_ref(), &session, &mut metadata).await;
            }
            return;
        }

        let release = ReleaseLock {
            tunnel: &tunnel,
            key: &key,
            lock: &lock,
        };

        // A creator that finished between our miss and taking the lock.
        let session = match tunnel.nat.get(&key) {
            Some(session) => session,
            None => match create_session(&tunnel, &key, packet.clone(), &mut metadata, fake_addr).await {
                Some(session) => session,
                None => return,
            },
        };
        drop(release);
        forward(&tunnel, packet.as_ref(), &session, &mut metadata).await;
    });
}

/// Drops the creation lock and wakes every waiter.
struct ReleaseLock<'a> {
    tunnel: &'a Tunnel,
    key: &'a str,
    lock: &'a SessionLock,
}

impl Drop for ReleaseLock<'_> {
    fn drop(&mut self) {
        self.tunnel.nat.delete_lock(self.key);
        self.lock.broadcast();
    }
}

async fn create_session(
    tunnel: &Arc<Tunnel>,
    key: &str,
    packet: Arc<dyn UdpPacket>,
    metadata: &mut Metadata,
    fake_addr: Option<SocketAddr>,
) -> Option<Session> {
    let (proxy, rule) = match tunnel.resolve_metadata(metadata).await {
        Ok(route) => route,
        Err(e) => {
            warn!("[UDP] parse metadata failed: {}", e);
            return None;
        }
    };

    if proxy.name() == Direct::NAME && metadata.dst_port == 53 {
        return None;
    }

    let raw = match proxy.dial_udp(metadata).await {
        Ok(raw) => raw,
        Err(source) => {
            let e = Error::Dial {
                proxy: proxy.name().to_string(),
                source,
            };
            warn!("[UDP] {}", e);
            return None;
        }
    };

    let tracker = UdpTracker::new(
        raw,
        tunnel.manager.clone(),
        metadata,
        proxy.chains(),
        rule.as_deref(),
    );
    tunnel.log_route(metadata, rule.as_ref(), tracker.chains());
    debug!(id = tracker.id(), "[UDP] session {} opened", key);
    let conn: Arc<dyn PacketConn> = Arc::new(tracker);

    let session = Session::new(conn, rule, tunnel.udp_timeout);
    tokio::spawn(relay_to_local(
        tunnel.clone(),
        packet,
        session.clone(),
        key.to_string(),
        fake_addr,
    ));
    tunnel.nat.set(key, session.clone());
    Some(session)
}

async fn forward(tunnel: &Tunnel, packet: &dyn UdpPacket, session: &Session, metadata: &mut Metadata) {
    if let Err(e) = handle_udp_to_remote(tunnel, packet, session, metadata).await {
        warn!("[UDP] forward to {} error: {}", metadata.remote_address(), e);
    }
}

async fn handle_udp_to_remote(
    tunnel: &Tunnel,
    packet: &dyn UdpPacket,
    session: &Session,
    metadata: &mut Metadata,
) -> Result<()> {
    if !metadata.resolved() {
        metadata.dst_ip = Some(tunnel.dns.resolve_ip(&metadata.host).await?);
    }
    let addr = metadata.udp_addr().ok_or(Error::InvalidMetadata)?;

    session.conn().write_to(packet.data(), addr).await?;
    session.touch();
    Ok(())
}

/// Copy replies back to the local peer until the session idles out or
/// either side fails, then drop the session.
async fn relay_to_local(
    tunnel: Arc<Tunnel>,
    packet: Arc<dyn UdpPacket>,
    session: Session,
    key: String,
    fake_addr: Option<SocketAddr>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let read = timeout_at(session.deadline(), session.conn().read_from(&mut buf)).await;
        let (n, from) = match read {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                debug!("[UDP] {} read error: {}", key, e);
                break;
            }
            // Forwarding may have pushed the deadline out while we slept.
            Err(_) if session.deadline() > tokio::time::Instant::now() => continue,
            Err(_) => {
                let rule = session.rule().map_or_else(|| "none".to_string(), |r| describe(r.as_ref()));
                debug!("[UDP] {} idle, closing session (rule {})", key, rule);
                break;
            }
        };

        session.touch();
        let from = fake_addr.unwrap_or(from);
        if let Err(e) = packet.write_back(&buf[..n], from).await {
            debug!("[UDP] {} write back error: {}", key, e);
            break;
        }
    }

    tunnel.nat.delete_session(&key, &session);
}
