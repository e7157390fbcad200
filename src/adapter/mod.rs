//! Outbound adapters.
//!
//! The dispatch engine only sees the [`Proxy`] capability. Protocol adapters
//! live elsewhere; this module ships the two that need no protocol at all.

mod direct;
mod reject;

pub use direct::Direct;
pub use reject::Reject;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::metadata::Metadata;

/// Byte stream returned by an outbound dial.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxStream = Box<dyn ProxyStream>;

/// Outbound packet path.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Ordered adapter names a connection went through, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain(Vec<String>);

impl Chain {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    pub fn single(name: &str) -> Self {
        Self(vec![name.to_string()])
    }

}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" -> "))
    }
}

/// Named outbound path.
#[async_trait]
pub trait Proxy: Send + Sync {
    fn name(&self) -> &str;

    fn support_udp(&self) -> bool;

    fn chains(&self) -> Chain {
        Chain::single(self.name())
    }

    async fn dial(&self, metadata: &Metadata) -> io::Result<BoxStream>;

    async fn dial_udp(&self, metadata: &Metadata) -> io::Result<Box<dyn PacketConn>>;
}

/// Source of a proxy set, refreshed by its own subsystem.
pub trait ProxyProvider: Send + Sync {
    fn name(&self) -> &str;

    fn proxies(&self) -> Vec<Arc<dyn Proxy>>;
}

pub type Proxies = FxHashMap<String, Arc<dyn Proxy>>;

pub type Providers = FxHashMap<String, Arc<dyn ProxyProvider>>;
