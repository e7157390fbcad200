use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};

use super::{BoxStream, PacketConn, Proxy};
use crate::metadata::Metadata;
use crate::resolver::Dns;

/// Dials the destination straight from this host.
pub struct Direct {
    name: String,
    dns: Arc<Dns>,
}

impl Direct {
    pub const NAME: &'static str = "DIRECT";

    pub fn new(dns: Arc<Dns>) -> Self {
        Self::named(Self::NAME, dns)
    }

    /// Direct path registered under another name, e.g. `GLOBAL`.
    pub fn named(name: &str, dns: Arc<Dns>) -> Self {
        Self {
            name: name.to_string(),
            dns,
        }
    }

    async fn destination(&self, metadata: &Metadata) -> io::Result<SocketAddr> {
        let ip = match metadata.dst_ip {
            Some(ip) => ip,
            None => self.dns.resolve_ip(&metadata.host).await?,
        };
        Ok(SocketAddr::new(ip, metadata.dst_port))
    }
}

#[async_trait]
impl Proxy for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial(&self, metadata: &Metadata) -> io::Result<BoxStream> {
        let addr = self.destination(metadata).await?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    /// The socket family follows the destination, resolving the host first
    /// when only a name is known. An unresolvable host binds IPv4.
    async fn dial_udp(&self, metadata: &Metadata) -> io::Result<Box<dyn PacketConn>> {
        let dst = self.destination(metadata).await.ok().map(|addr| addr.ip());
        let socket = UdpSocket::bind(bind_addr(dst)).await?;
        Ok(Box::new(DirectPacketConn { socket }))
    }
}

fn bind_addr(dst: Option<IpAddr>) -> SocketAddr {
    let ip: IpAddr = match dst {
        Some(IpAddr::V6(_)) => Ipv6Addr::UNSPECIFIED.into(),
        _ => Ipv4Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, 0)
}

struct DirectPacketConn {
    socket: UdpSocket,
}

#[async_trait]
impl PacketConn for DirectPacketConn {
    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr).await
    }

    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
