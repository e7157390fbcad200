use super::{Rule, RuleType};
use crate::error::{Error, Result};
use crate::metadata::{Metadata, Network};

/// Port match, single port or `low-high` range.
#[derive(Debug, Clone)]
pub struct Port {
    low: u16,
    high: u16,
    payload: String,
    adapter: String,
    source: bool,
}

impl Port {
    pub fn destination(ports: &str, adapter: &str) -> Result<Self> {
        Self::new(ports, adapter, false)
    }

    pub fn source(ports: &str, adapter: &str) -> Result<Self> {
        Self::new(ports, adapter, true)
    }

    fn new(ports: &str, adapter: &str, source: bool) -> Result<Self> {
        let invalid = || Error::InvalidRule(ports.to_string());
        let (low, high) = match ports.split_once('-') {
            Some((low, high)) => (
                low.trim().parse::<u16>().map_err(|_| invalid())?,
                high.trim().parse::<u16>().map_err(|_| invalid())?,
            ),
            None => {
                let port = ports.trim().parse::<u16>().map_err(|_| invalid())?;
                (port, port)
            }
        };
        if low > high {
            return Err(invalid());
        }
        Ok(Self {
            low,
            high,
            payload: ports.to_string(),
            adapter: adapter.to_string(),
            source,
        })
    }
}

impl Rule for Port {
    fn rule_type(&self) -> RuleType {
        if self.source {
            RuleType::SrcPort
        } else {
            RuleType::DstPort
        }
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        let port = if self.source {
            metadata.src_port
        } else {
            metadata.dst_port
        };
        (self.low..=self.high).contains(&port)
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}

/// Transport match (`tcp` / `udp`).
#[derive(Debug, Clone)]
pub struct NetworkRule {
    network: Network,
    payload: String,
    adapter: String,
}

impl NetworkRule {
    pub fn new(network: &str, adapter: &str) -> Result<Self> {
        let parsed = match network.to_ascii_lowercase().as_str() {
            "tcp" => Network::Tcp,
            "udp" => Network::Udp,
            _ => return Err(Error::InvalidRule(network.to_string())),
        };
        Ok(Self {
            network: parsed,
            payload: network.to_ascii_lowercase(),
            adapter: adapter.to_string(),
        })
    }
}

impl Rule for NetworkRule {
    fn rule_type(&self) -> RuleType {
        RuleType::Network
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        metadata.network == self.network
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}
