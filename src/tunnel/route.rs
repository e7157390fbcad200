//! Metadata pre-handling and rule matching.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use super::{Routing, Tunnel, TunnelMode};
use crate::adapter::{Chain, Direct, Proxy};
use crate::error::{Error, Result};
use crate::metadata::{AddrType, DnsMode, Metadata, Network};
use crate::rules::Rule;

/// Name of the adapter used by global mode.
pub const GLOBAL: &str = "GLOBAL";

/// Outbound chosen for a request plus the rule that chose it.
pub(crate) type Route = (Arc<dyn Proxy>, Option<Arc<dyn Rule>>);

impl Tunnel {
    /// Normalize a request before routing.
    ///
    /// A literal IP host also becomes the destination address; the host
    /// string is kept. With a mapping resolver installed, a bare destination
    /// address is mapped back to its host; an unmapped fake IP fails the
    /// request.
    pub fn pre_handle_metadata(&self, metadata: &mut Metadata) -> Result<()> {
        if let Ok(ip) = metadata.host.parse::<IpAddr>() {
            metadata.dst_ip = Some(ip);
        }

        let Some(ip) = metadata.dst_ip else {
            return Ok(());
        };
        if !metadata.host.is_empty() || !self.dns.mapping_enabled() {
            return Ok(());
        }

        match self.dns.find_host_by_ip(ip) {
            Some(host) => {
                metadata.addr_type = AddrType::Domain;
                metadata.dns_mode = DnsMode::Mapping;
                if self.dns.fake_ip_enabled() {
                    metadata.dst_ip = None;
                    metadata.dns_mode = DnsMode::FakeIp;
                } else if let Some(ip) = self.dns.search_host(&host) {
                    metadata.dst_ip = Some(ip);
                }
                metadata.host = host;
                Ok(())
            }
            None if self.dns.is_fake_ip(ip) => Err(Error::FakeRecordMissing(ip)),
            None => Ok(()),
        }
    }

    /// Pick the outbound for `metadata` according to the current mode.
    pub async fn resolve_metadata(&self, metadata: &mut Metadata) -> Result<Route> {
        let routing = self.routing();
        match self.mode() {
            TunnelMode::Direct => Ok((lookup(&routing, Direct::NAME)?, None)),
            TunnelMode::Global => Ok((lookup(&routing, GLOBAL)?, None)),
            TunnelMode::Rule => self.match_rules(metadata, &routing).await,
        }
    }

    /// Walk the rules in order. The first match whose adapter exists and can
    /// carry this network wins; otherwise the request goes `DIRECT`.
    ///
    /// The host is resolved at most once, and only when a rule asks for it.
    async fn match_rules(&self, metadata: &mut Metadata, routing: &Routing) -> Result<Route> {
        let mut resolved = false;
        if let Some(ip) = self.dns.search_host(&metadata.host) {
            metadata.dst_ip = Some(ip);
            resolved = true;
        }

        for rule in routing.rules.iter() {
            if !resolved && should_resolve_ip(rule.as_ref(), metadata) {
                match self.dns.resolve_ip(&metadata.host).await {
                    Ok(ip) => {
                        debug!("[DNS] {} --> {}", metadata.host, ip);
                        metadata.dst_ip = Some(ip);
                    }
                    Err(e) => debug!("[DNS] resolve {} error: {}", metadata.host, e),
                }
                resolved = true;
            }

            if !rule.matches(metadata) {
                continue;
            }
            let Some(adapter) = routing.proxies.get(rule.adapter()) else {
                continue;
            };
            if metadata.network == Network::Udp && !adapter.support_udp() {
                debug!("{} UDP is not supported", adapter.name());
                continue;
            }
            return Ok((adapter.clone(), Some(rule.clone())));
        }

        Ok((lookup(routing, Direct::NAME)?, None))
    }

    pub(crate) fn log_route(&self, metadata: &Metadata, rule: Option<&Arc<dyn Rule>>, chains: &Chain) {
        let network = metadata.network;
        let src = metadata.source_address();
        let dst = match metadata.dns_mode {
            DnsMode::Normal => metadata.remote_address(),
            mode => format!("{} ({mode})", metadata.remote_address()),
        };
        match (rule, self.mode()) {
            (Some(rule), _) => info!(
                "[{network}] {src} --> {dst} match {}({}) using {chains}",
                rule.rule_type(),
                rule.payload()
            ),
            (None, TunnelMode::Global) => info!("[{network}] {src} --> {dst} using GLOBAL"),
            (None, TunnelMode::Direct) => info!("[{network}] {src} --> {dst} using DIRECT"),
            (None, TunnelMode::Rule) => {
                info!("[{network}] {src} --> {dst} doesn't match any rule using DIRECT")
            }
        }
    }
}

fn lookup(routing: &Routing, name: &str) -> Result<Arc<dyn Proxy>> {
    routing
        .proxies
        .get(name)
        .cloned()
        .ok_or_else(|| Error::ProxyNotFound(name.to_string()))
}

fn should_resolve_ip(rule: &dyn Rule, metadata: &Metadata) -> bool {
    rule.should_resolve_ip() && !metadata.host.is_empty() && metadata.dst_ip.is_none()
}
