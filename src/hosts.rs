//! Static host table.

use std::net::IpAddr;

use rustc_hash::FxHashMap;

/// Exact-match table from hostname to address.
///
/// Keys are stored lowercase; lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Hosts {
    entries: FxHashMap<String, IpAddr>,
}

impl Hosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: &str, ip: IpAddr) {
        self.entries.insert(host.to_ascii_lowercase(), ip);
    }

    /// Look up the address mapped to `host`.
    pub fn search(&self, host: &str) -> Option<IpAddr> {
        if host.is_empty() {
            return None;
        }
        if let Some(ip) = self.entries.get(host) {
            return Some(*ip);
        }
        if host.bytes().any(|b| b.is_ascii_uppercase()) {
            return self.entries.get(&host.to_ascii_lowercase()).copied();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, IpAddr)> for Hosts {
    fn from_iter<I: IntoIterator<Item = (String, IpAddr)>>(iter: I) -> Self {
        let mut hosts = Hosts::new();
        for (host, ip) in iter {
            hosts.insert(&host, ip);
        }
        hosts
    }
}
