//! Connection request descriptors.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Transport of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "TCP",
            Network::Udp => "UDP",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the destination was expressed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    Ipv4,
    Ipv6,
    Domain,
}

/// DNS mode the inbound observed when the request was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsMode {
    #[default]
    Normal,
    FakeIp,
    Mapping,
}

impl fmt::Display for DnsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DnsMode::Normal => "normal",
            DnsMode::FakeIp => "fake-ip",
            DnsMode::Mapping => "mapping",
        })
    }
}

/// Describes one connection or packet request.
///
/// Produced by an inbound, then filled in place by pre-handling and routing
/// (`host` and `dst_ip` may both change before the dial).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub network: Network,
    pub src_ip: Option<IpAddr>,
    pub src_port: u16,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub addr_type: AddrType,
    pub host: String,
    pub dns_mode: DnsMode,
}

impl Metadata {
    /// Request for `host:port` coming from `source`.
    ///
    /// A literal IP in `host` is stored as the destination address instead.
    pub fn new(network: Network, source: SocketAddr, host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Self::with_ip(network, source, SocketAddr::new(ip, port)),
            Err(_) => Self {
                network,
                src_ip: Some(source.ip()),
                src_port: source.port(),
                dst_ip: None,
                dst_port: port,
                addr_type: AddrType::Domain,
                host: host.to_string(),
                dns_mode: DnsMode::Normal,
            },
        }
    }

    /// Request for a bare destination address.
    pub fn with_ip(network: Network, source: SocketAddr, destination: SocketAddr) -> Self {
        let addr_type = match destination.ip() {
            IpAddr::V4(_) => AddrType::Ipv4,
            IpAddr::V6(_) => AddrType::Ipv6,
        };
        Self {
            network,
            src_ip: Some(source.ip()),
            src_port: source.port(),
            dst_ip: Some(destination.ip()),
            dst_port: destination.port(),
            addr_type,
            host: String::new(),
            dns_mode: DnsMode::Normal,
        }
    }

    /// A request is usable when it names a destination one way or another.
    pub fn valid(&self) -> bool {
        !self.host.is_empty() || self.dst_ip.is_some()
    }

    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// Destination as a socket address, if an IP is known.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
    }

    pub fn source_address(&self) -> String {
        match self.src_ip {
            Some(ip) => SocketAddr::new(ip, self.src_port).to_string(),
            None => format!("<nil>:{}", self.src_port),
        }
    }

    pub fn remote_address(&self) -> String {
        format!("{}:{}", self, self.dst_port)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.host.is_empty() {
            return f.write_str(&self.host);
        }
        match self.dst_ip {
            Some(ip) => write!(f, "{ip}"),
            None => f.write_str("<nil>"),
        }
    }
}
