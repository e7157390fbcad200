//! Hostname rules.

use super::{Rule, RuleType};
use crate::metadata::Metadata;

/// Exact hostname match.
#[derive(Debug, Clone)]
pub struct Domain {
    domain: String,
    adapter: String,
}

impl Domain {
    pub fn new(domain: &str, adapter: &str) -> Self {
        Self {
            domain: domain.to_lowercase(),
            adapter: adapter.to_string(),
        }
    }
}

impl Rule for Domain {
    fn rule_type(&self) -> RuleType {
        RuleType::Domain
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        !metadata.host.is_empty() && metadata.host.eq_ignore_ascii_case(&self.domain)
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.domain
    }
}

/// Matches the suffix itself and every subdomain of it.
///
/// `example.com` matches `example.com` and `ads.example.com`, but not
/// `badexample.com`.
#[derive(Debug, Clone)]
pub struct DomainSuffix {
    suffix: String,
    adapter: String,
}

impl DomainSuffix {
    pub fn new(suffix: &str, adapter: &str) -> Self {
        Self {
            suffix: suffix.trim_start_matches('.').to_lowercase(),
            adapter: adapter.to_string(),
        }
    }
}

impl Rule for DomainSuffix {
    fn rule_type(&self) -> RuleType {
        RuleType::DomainSuffix
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        if metadata.host.is_empty() {
            return false;
        }
        let host = metadata.host.to_lowercase();
        let mut current = host.as_str();

        loop {
            if current == self.suffix {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return false,
            }
        }
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.suffix
    }
}

/// Substring match on the hostname.
#[derive(Debug, Clone)]
pub struct DomainKeyword {
    keyword: String,
    adapter: String,
}

impl DomainKeyword {
    pub fn new(keyword: &str, adapter: &str) -> Self {
        Self {
            keyword: keyword.to_lowercase(),
            adapter: adapter.to_string(),
        }
    }
}

impl Rule for DomainKeyword {
    fn rule_type(&self) -> RuleType {
        RuleType::DomainKeyword
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        !metadata.host.is_empty() && metadata.host.to_lowercase().contains(&self.keyword)
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.keyword
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;

    fn host(h: &str) -> Metadata {
        Metadata::new(Network::Tcp, "10.0.0.2:5000".parse().unwrap(), h, 443)
    }

    #[test]
    fn domain_exact_match() {
        let rule = Domain::new("Example.com", "Proxy");

        assert!(rule.matches(&host("example.com")));
        assert!(rule.matches(&host("EXAMPLE.COM")));
        assert!(!rule.matches(&host("www.example.com")));
    }

    #[test]
    fn suffix_matches_subdomains() {
        let rule = DomainSuffix::new("doubleclick.com", "REJECT");

        assert!(rule.matches(&host("doubleclick.com")));
        assert!(rule.matches(&host("ads.doubleclick.com")));
        assert!(rule.matches(&host("tracker.ads.DoubleClick.com")));
    }

    #[test]
    fn suffix_requires_label_boundary() {
        let rule = DomainSuffix::new(".example.com", "Proxy");

        assert!(!rule.matches(&host("badexample.com")));
        assert!(!rule.matches(&host("example.org")));
        assert!(!rule.matches(&host("")));
    }

    #[test]
    fn keyword_substring() {
        let rule = DomainKeyword::new("tube", "Proxy");

        assert!(rule.matches(&host("www.youtube.com")));
        assert!(!rule.matches(&host("example.com")));
    }

    #[test]
    fn literal_ip_destination_never_matches_domain_rules() {
        let ip_only = host("93.184.216.34");

        assert!(!Domain::new("93.184.216.34", "Proxy").matches(&ip_only));
        assert!(!DomainKeyword::new("93", "Proxy").matches(&ip_only));
    }
}
