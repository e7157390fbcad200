//! Routing rules.
//!
//! Each rule answers three questions about a request: does it match, which
//! adapter does it select, and does matching need a resolved destination IP.
//! Rule lists are immutable once built and replaced as a whole.

mod domain;
mod ip;
mod logic;
mod port;

pub use domain::{Domain, DomainKeyword, DomainSuffix};
pub use ip::IpCidr;
pub use logic::{And, Match, Not, Or};
pub use port::{NetworkRule, Port};

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::metadata::Metadata;

/// Rule variant tag, used for logging and parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    Domain,
    DomainSuffix,
    DomainKeyword,
    IpCidr,
    SrcIpCidr,
    SrcPort,
    DstPort,
    Network,
    And,
    Or,
    Not,
    Match,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Domain => "DOMAIN",
            RuleType::DomainSuffix => "DOMAIN-SUFFIX",
            RuleType::DomainKeyword => "DOMAIN-KEYWORD",
            RuleType::IpCidr => "IP-CIDR",
            RuleType::SrcIpCidr => "SRC-IP-CIDR",
            RuleType::SrcPort => "SRC-PORT",
            RuleType::DstPort => "DST-PORT",
            RuleType::Network => "NETWORK",
            RuleType::And => "AND",
            RuleType::Or => "OR",
            RuleType::Not => "NOT",
            RuleType::Match => "MATCH",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing rule.
pub trait Rule: Send + Sync + fmt::Debug {
    fn rule_type(&self) -> RuleType;

    fn matches(&self, metadata: &Metadata) -> bool;

    /// Name of the adapter this rule selects.
    fn adapter(&self) -> &str;

    fn payload(&self) -> &str;

    /// Matching needs `metadata.dst_ip` filled in.
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

/// `TYPE,payload` form used in logs.
pub fn describe(rule: &dyn Rule) -> String {
    if rule.payload().is_empty() {
        return rule.rule_type().to_string();
    }
    format!("{},{}", rule.rule_type(), rule.payload())
}

/// Parse a rule line: `TYPE,payload,adapter[,no-resolve]` or `MATCH,adapter`.
pub fn parse_rule(line: &str) -> Result<Arc<dyn Rule>> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    let invalid = || Error::InvalidRule(line.to_string());

    let kind = parts.first().copied().ok_or_else(invalid)?;
    if kind.eq_ignore_ascii_case("MATCH") || kind.eq_ignore_ascii_case("FINAL") {
        let adapter = parts.get(1).copied().filter(|a| !a.is_empty()).ok_or_else(invalid)?;
        return Ok(Arc::new(Match::new(adapter)));
    }

    let (payload, adapter) = match (parts.get(1), parts.get(2)) {
        (Some(p), Some(a)) if !p.is_empty() && !a.is_empty() => (*p, *a),
        _ => return Err(invalid()),
    };
    let no_resolve = parts[3..]
        .iter()
        .any(|opt| opt.eq_ignore_ascii_case("no-resolve"));

    let rule: Arc<dyn Rule> = match kind.to_ascii_uppercase().as_str() {
        "DOMAIN" => Arc::new(Domain::new(payload, adapter)),
        "DOMAIN-SUFFIX" => Arc::new(DomainSuffix::new(payload, adapter)),
        "DOMAIN-KEYWORD" => Arc::new(DomainKeyword::new(payload, adapter)),
        "IP-CIDR" | "IP-CIDR6" => Arc::new(IpCidr::destination(payload, adapter, no_resolve)?),
        "SRC-IP-CIDR" => Arc::new(IpCidr::source(payload, adapter)?),
        "SRC-PORT" => Arc::new(Port::source(payload, adapter)?),
        "DST-PORT" => Arc::new(Port::destination(payload, adapter)?),
        "NETWORK" => Arc::new(NetworkRule::new(payload, adapter)?),
        _ => return Err(invalid()),
    };
    Ok(rule)
}
