//! Forwarding server orchestration.
//!
//! Binds the TCP and UDP listeners, feeds them into the tunnel and reports
//! traffic periodically.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::inbound::Target;
use crate::inbound::tcp::TcpInbound;
use crate::inbound::udp::UdpInbound;
use crate::tunnel::Tunnel;

/// How often traffic counters are logged.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct ServerConfig {
    /// Local address both listeners bind to.
    pub bind_addr: SocketAddr,
    /// Destination every inbound request is addressed to.
    pub target: Target,
}

/// Run the forwarding server. Never returns unless a listener fails to bind.
pub async fn run(config: ServerConfig, tunnel: Arc<Tunnel>) -> io::Result<()> {
    let tcp = TcpInbound::bind(config.bind_addr).await?;
    let udp = UdpInbound::bind(config.bind_addr).await?;

    info!(
        "listening on {} (mode {}, {} rules, {} proxies)",
        config.bind_addr,
        tunnel.mode(),
        tunnel.rules().len(),
        tunnel.proxies().len()
    );
    info!("forwarding to {}:{}", config.target.host, config.target.port);

    tunnel.start();
    tcp.start(config.target.clone(), tunnel.clone());
    udp.start(config.target, tunnel.clone());

    let start = tokio::time::Instant::now();
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let manager = tunnel.manager();
        let traffic = manager.snapshot_and_reset();
        info!(
            "[stats] uptime={}s active={} sessions={} up={} down={} total_up={} total_down={} failed_dials={}",
            start.elapsed().as_secs(),
            traffic.active,
            tunnel.nat().len(),
            traffic.upload,
            traffic.download,
            manager.upload_total(),
            manager.download_total(),
            tunnel.failed_dials()
        );
    }
}
