//! Forwarding UDP listener.
//!
//! Datagrams are keyed by their sender, so each client address becomes its
//! own session on the tunnel. Replies go back out of the listening socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::warn;

use super::{MAX_PACKET_SIZE, PacketAdapter, Target, UdpPacket};
use crate::metadata::{Metadata, Network};
use crate::tunnel::Tunnel;

pub struct UdpInbound {
    socket: Arc<UdpSocket>,
}

impl UdpInbound {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the receive loop.
    pub fn start(self, target: Target, tunnel: Arc<Tunnel>) {
        tokio::spawn(run(self.socket, target, tunnel));
    }
}

/// One datagram received on the listening socket.
struct ForwardedPacket {
    socket: Arc<UdpSocket>,
    data: Vec<u8>,
    peer: SocketAddr,
}

#[async_trait]
impl UdpPacket for ForwardedPacket {
    fn data(&self) -> &[u8] {
        &self.data
    }

    /// A plain socket cannot spoof the source, so `from` is not used.
    async fn write_back(&self, buf: &[u8], _from: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, self.peer).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.peer
    }
}

async fn run(socket: Arc<UdpSocket>, target: Target, tunnel: Arc<Tunnel>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("[UDP] recv error: {}", e);
                continue;
            }
        };

        let packet = ForwardedPacket {
            socket: socket.clone(),
            data: buf[..len].to_vec(),
            peer,
        };
        let metadata = Metadata::new(Network::Udp, peer, &target.host, target.port);
        tunnel.add_packet(PacketAdapter::new(Arc::new(packet), metadata));
    }
}
