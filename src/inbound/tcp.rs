//! Forwarding TCP listener.
//!
//! Every accepted connection becomes a request for the fixed target and is
//! queued on the tunnel.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use super::{InboundConn, InboundKind, Target};
use crate::metadata::{Metadata, Network};
use crate::tunnel::Tunnel;

pub struct TcpInbound {
    listener: TcpListener,
}

impl TcpInbound {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop.
    pub fn start(self, target: Target, tunnel: Arc<Tunnel>) {
        tokio::spawn(run_accept_loop(self.listener, target, tunnel));
    }
}

async fn run_accept_loop(listener: TcpListener, target: Target, tunnel: Arc<Tunnel>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("[TCP] set_nodelay for {} failed: {}", peer, e);
                }
                let metadata = Metadata::new(Network::Tcp, peer, &target.host, target.port);
                let conn = InboundConn::new(InboundKind::Socket, metadata, Box::new(stream));
                tunnel.add(conn).await;
            }
            Err(e) => {
                warn!("[TCP] accept error: {}", e);
            }
        }
    }
}
