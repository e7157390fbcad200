use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use ipnet::Ipv4Net;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waypoint::adapter::{Direct, Proxies, Providers, Proxy, Reject};
use waypoint::hosts::Hosts;
use waypoint::inbound::Target;
use waypoint::resolver::{Dns, FakeIpResolver, SystemLookup};
use waypoint::rules::parse_rule;
use waypoint::server::{self, ServerConfig};
use waypoint::tracker::Manager;
use waypoint::tunnel::{GLOBAL, Tunnel, TunnelConfig, TunnelMode};

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Rule-based TCP/UDP forwarding tunnel", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value = "7890")]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Destination every connection is forwarded to (host:port)
    #[arg(short, long)]
    target: Target,

    /// Routing mode: rule, global or direct
    #[arg(short, long, default_value = "rule")]
    mode: TunnelMode,

    /// Static host entry, repeatable (name=ip)
    #[arg(long = "host", value_parser = parse_host)]
    hosts: Vec<(String, IpAddr)>,

    /// Routing rule, repeatable (e.g. DOMAIN-SUFFIX,example.com,REJECT)
    #[arg(short, long = "rule")]
    rules: Vec<String>,

    /// Answer lookups from this fake-IP range
    #[arg(long)]
    fake_ip_range: Option<Ipv4Net>,

    /// Allow IPv6 resolution
    #[arg(long)]
    ipv6: bool,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_host(s: &str) -> Result<(String, IpAddr), String> {
    let (name, ip) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=ip, got {s}"))?;
    let ip = ip.parse().map_err(|e| format!("invalid address in {s}: {e}"))?;
    Ok((name.to_string(), ip))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> io::Result<()> {
    let dns = Arc::new(Dns::new());
    dns.set_disable_ipv6(!args.ipv6);
    dns.set_hosts(args.hosts.into_iter().collect::<Hosts>());
    if let Some(range) = args.fake_ip_range {
        info!("fake-ip enabled on {}", range);
        dns.set_external(Some(Arc::new(FakeIpResolver::new(range, Arc::new(SystemLookup)))));
    }

    let rules = args
        .rules
        .iter()
        .map(|line| parse_rule(line))
        .collect::<waypoint::Result<Vec<_>>>()?;

    let config = TunnelConfig {
        mode: args.mode,
        ..TunnelConfig::default()
    };
    let tunnel = Tunnel::new(config, dns.clone(), Arc::new(Manager::new()));

    let mut proxies = Proxies::default();
    let builtin: [Arc<dyn Proxy>; 3] = [
        Arc::new(Direct::new(dns.clone())),
        Arc::new(Direct::named(GLOBAL, dns)),
        Arc::new(Reject),
    ];
    for proxy in builtin {
        proxies.insert(proxy.name().to_string(), proxy);
    }
    tunnel.update_proxies(proxies, Providers::default());
    tunnel.update_rules(rules);

    let config = ServerConfig {
        bind_addr: SocketAddr::new(args.bind, args.port),
        target: args.target,
    };
    server::run(config, tunnel).await
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(args))
}
