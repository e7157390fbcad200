//! Inbound requests.
//!
//! Listeners turn accepted connections and received datagrams into metadata
//! bearing requests and push them onto the tunnel queues. The forwarding
//! listeners in [`tcp`] and [`udp`] send everything to one fixed target.

pub mod tcp;
pub mod udp;

/// Maximum size of a relayed datagram.
pub const MAX_PACKET_SIZE: usize = 65535;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::BoxStream;
use crate::metadata::Metadata;

/// Which inbound protocol produced a TCP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Http,
    Socket,
}

impl InboundKind {
    fn as_str(self) -> &'static str {
        match self {
            InboundKind::Http => "HTTP",
            InboundKind::Socket => "Socket",
        }
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted TCP connection waiting for an outbound.
pub struct InboundConn {
    kind: InboundKind,
    metadata: Metadata,
    stream: BoxStream,
}

impl InboundConn {
    pub fn new(kind: InboundKind, metadata: Metadata, stream: BoxStream) -> Self {
        Self {
            kind,
            metadata,
            stream,
        }
    }

    pub fn kind(&self) -> InboundKind {
        self.kind
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn into_stream(self) -> BoxStream {
        self.stream
    }
}

/// One received datagram and the way back to its sender.
#[async_trait]
pub trait UdpPacket: Send + Sync {
    fn data(&self) -> &[u8];

    /// Send a reply to the original sender, claiming to come from `from`.
    async fn write_back(&self, buf: &[u8], from: SocketAddr) -> io::Result<usize>;

    /// Address of the local peer; identifies the session.
    fn local_addr(&self) -> SocketAddr;
}

/// Datagram plus its request metadata.
pub struct PacketAdapter {
    packet: Arc<dyn UdpPacket>,
    metadata: Metadata,
}

impl PacketAdapter {
    pub fn new(packet: Arc<dyn UdpPacket>, metadata: Metadata) -> Self {
        Self { packet, metadata }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn into_parts(self) -> (Arc<dyn UdpPacket>, Metadata) {
        (self.packet, self.metadata)
    }
}

/// Fixed destination of a forwarding listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl std::str::FromStr for Target {
    type Err = String;

    /// Parses `host:port`, `a.b.c.d:port` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self {
                host: addr.ip().to_string(),
                port: addr.port(),
            });
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in {s}"))?;
        let port = port.parse().map_err(|_| format!("invalid port in {s}"))?;
        if host.is_empty() || host.contains(':') {
            return Err(format!("invalid host in {s}"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}
