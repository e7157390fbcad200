use std::net::IpAddr;

use ipnet::IpNet;

use super::{Rule, RuleType};
use crate::error::{Error, Result};
use crate::metadata::Metadata;

/// CIDR match against the destination or the source address.
#[derive(Debug, Clone)]
pub struct IpCidr {
    net: IpNet,
    payload: String,
    adapter: String,
    source: bool,
    no_resolve: bool,
}

impl IpCidr {
    /// Destination CIDR. Unless `no_resolve`, hostnames are resolved first.
    pub fn destination(cidr: &str, adapter: &str, no_resolve: bool) -> Result<Self> {
        Self::new(cidr, adapter, false, no_resolve)
    }

    /// Source CIDR. The source is always an address, so nothing is resolved.
    pub fn source(cidr: &str, adapter: &str) -> Result<Self> {
        Self::new(cidr, adapter, true, true)
    }

    fn new(cidr: &str, adapter: &str, source: bool, no_resolve: bool) -> Result<Self> {
        let net = parse_net(cidr).ok_or_else(|| Error::InvalidRule(cidr.to_string()))?;
        Ok(Self {
            net,
            payload: cidr.to_string(),
            adapter: adapter.to_string(),
            source,
            no_resolve,
        })
    }
}

/// Accepts `a.b.c.d/len`, or a bare address as a host route.
fn parse_net(cidr: &str) -> Option<IpNet> {
    if let Ok(net) = cidr.parse::<IpNet>() {
        return Some(net.trunc());
    }
    cidr.parse::<IpAddr>().ok().map(IpNet::from)
}

impl Rule for IpCidr {
    fn rule_type(&self) -> RuleType {
        if self.source {
            RuleType::SrcIpCidr
        } else {
            RuleType::IpCidr
        }
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        let ip = if self.source {
            metadata.src_ip
        } else {
            metadata.dst_ip
        };
        ip.is_some_and(|ip| self.net.contains(&ip))
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn should_resolve_ip(&self) -> bool {
        !self.no_resolve
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;

    fn to(dst: &str) -> Metadata {
        Metadata::with_ip(
            Network::Tcp,
            "192.168.1.20:5000".parse().unwrap(),
            dst.parse().unwrap(),
        )
    }

    #[test]
    fn destination_cidr() {
        let rule = IpCidr::destination("10.0.0.0/8", "DIRECT", false).unwrap();

        assert!(rule.matches(&to("10.1.2.3:80")));
        assert!(!rule.matches(&to("11.0.0.1:80")));
        assert!(rule.should_resolve_ip());
        assert_eq!(rule.rule_type(), RuleType::IpCidr);
    }

    #[test]
    fn unresolved_destination_never_matches() {
        let rule = IpCidr::destination("0.0.0.0/0", "DIRECT", false).unwrap();
        let m = Metadata::new(Network::Tcp, "192.168.1.20:5000".parse().unwrap(), "example.com", 80);

        assert!(!rule.matches(&m));
    }

    #[test]
    fn ipv6_cidr() {
        let rule = IpCidr::destination("2001:db8::/32", "Proxy", true).unwrap();

        assert!(rule.matches(&to("[2001:db8::1]:443")));
        assert!(!rule.matches(&to("1.2.3.4:443")));
        assert!(!rule.should_resolve_ip());
    }

    #[test]
    fn source_cidr() {
        let rule = IpCidr::source("192.168.1.0/24", "Proxy").unwrap();

        assert!(rule.matches(&to("8.8.8.8:53")));
        assert!(!rule.should_resolve_ip());
        assert_eq!(rule.rule_type(), RuleType::SrcIpCidr);
    }

    #[test]
    fn bare_address_and_host_bits() {
        let host = IpCidr::destination("8.8.8.8", "DIRECT", true).unwrap();
        let sloppy = IpCidr::destination("10.1.2.3/8", "DIRECT", true).unwrap();

        assert!(host.matches(&to("8.8.8.8:53")));
        assert!(!host.matches(&to("8.8.4.4:53")));
        assert!(sloppy.matches(&to("10.200.0.1:80")));
    }
}
