//! Fake-IP resolver.
//!
//! Hands out synthetic addresses from a reserved range so the real lookup can
//! be deferred to dial time, and remembers which host each address stands for.

use std::iter::Cycle;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ipnet::{Ipv4AddrRange, Ipv4Net};
use rustc_hash::FxHashMap;

use super::cache::{Family, Lookup, ResolverCache};
use super::Resolver;
use crate::error::{Error, Result};

struct Pool {
    cycle: Cycle<Ipv4AddrRange>,
    by_host: FxHashMap<String, Ipv4Addr>,
    by_ip: FxHashMap<Ipv4Addr, String>,
}

/// Resolver backing the fake-IP DNS mode.
///
/// Addresses are recycled round-robin; a recycled address drops the binding
/// of its previous host.
pub struct FakeIpResolver {
    network: Ipv4Net,
    pool: Mutex<Pool>,
    cache: ResolverCache,
}

impl FakeIpResolver {
    /// `upstream` answers the real lookups the router still needs for IP rules
    /// and dial time. Its answers are cached per host.
    pub fn new(network: Ipv4Net, upstream: Arc<dyn Lookup>) -> Self {
        Self {
            network,
            pool: Mutex::new(Pool {
                cycle: network.hosts().cycle(),
                by_host: FxHashMap::default(),
                by_ip: FxHashMap::default(),
            }),
            cache: ResolverCache::new(upstream),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fake address bound to `host`, allocating one if needed.
    pub fn fake_ip_for(&self, host: &str) -> IpAddr {
        let host = host.to_ascii_lowercase();
        let mut pool = self.lock();
        if let Some(ip) = pool.by_host.get(&host) {
            return IpAddr::V4(*ip);
        }

        // A non-empty network always yields another host address.
        let ip = pool.cycle.next().unwrap_or(self.network.network());
        if let Some(previous) = pool.by_ip.remove(&ip) {
            pool.by_host.remove(&previous);
        }
        pool.by_host.insert(host.clone(), ip);
        pool.by_ip.insert(ip, host);
        IpAddr::V4(ip)
    }

    async fn lookup(&self, host: &str, family: Family) -> Result<IpAddr> {
        self.cache
            .resolve(host, family)
            .await
            .map_err(Error::Lookup)?
            .ok_or(Error::IpNotFound)
    }
}

#[async_trait]
impl Resolver for FakeIpResolver {
    async fn resolve_ip(&self, host: &str) -> Result<IpAddr> {
        self.lookup(host, Family::Any).await
    }

    async fn resolve_ipv4(&self, host: &str) -> Result<IpAddr> {
        self.lookup(host, Family::V4).await
    }

    async fn resolve_ipv6(&self, host: &str) -> Result<IpAddr> {
        self.lookup(host, Family::V6).await
    }

    fn fake_ip_enabled(&self) -> bool {
        true
    }

    fn is_fake_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.network.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }

    fn is_exist_fake_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.lock().by_ip.contains_key(&v4),
            IpAddr::V6(_) => false,
        }
    }

    fn find_host_by_ip(&self, ip: IpAddr) -> Option<String> {
        match ip {
            IpAddr::V4(v4) => self.lock().by_ip.get(&v4).cloned(),
            IpAddr::V6(_) => None,
        }
    }
}
