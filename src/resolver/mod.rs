//! Host resolution.
//!
//! Resolution goes through a fixed sequence of strategies:
//! 1. Static host table
//! 2. Literal IP parsing (family-checked)
//! 3. Pluggable external resolver (enhanced DNS modes)
//! 4. Per-host refresh cache over the system resolver
//!
//! [`Dns`] owns the policy (IPv6 switch, host table, external resolver) and is
//! shared by the router and the direct outbound.

mod cache;
mod fakeip;

pub use cache::{Family, Lookup, REFRESH_DEBOUNCE, ResolverCache, STALE_AFTER, SystemLookup};
pub use fakeip::FakeIpResolver;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::hosts::Hosts;

/// External resolver that replaces the built-in cache.
///
/// The enhanced-mode hooks default to "not enhanced"; a fake-IP or
/// host-mapping resolver overrides them.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_ip(&self, host: &str) -> Result<IpAddr>;
    async fn resolve_ipv4(&self, host: &str) -> Result<IpAddr>;
    async fn resolve_ipv6(&self, host: &str) -> Result<IpAddr>;

    /// Answers carry real addresses that can be mapped back to hosts.
    fn is_mapping(&self) -> bool {
        false
    }

    fn fake_ip_enabled(&self) -> bool {
        false
    }

    /// `ip` lies inside the fake-IP range.
    fn is_fake_ip(&self, _ip: IpAddr) -> bool {
        false
    }

    /// `ip` is a fake IP currently bound to a host.
    fn is_exist_fake_ip(&self, _ip: IpAddr) -> bool {
        false
    }

    fn find_host_by_ip(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Process-wide resolution facade.
pub struct Dns {
    hosts: RwLock<Arc<Hosts>>,
    external: RwLock<Option<Arc<dyn Resolver>>>,
    disable_ipv6: AtomicBool,
    cache: ResolverCache,
}

impl Dns {
    /// Facade over the system resolver. IPv6 starts disabled.
    pub fn new() -> Self {
        Self::with_lookup(Arc::new(SystemLookup))
    }

    pub fn with_lookup(lookup: Arc<dyn Lookup>) -> Self {
        Self {
            hosts: RwLock::new(Arc::new(Hosts::new())),
            external: RwLock::new(None),
            disable_ipv6: AtomicBool::new(true),
            cache: ResolverCache::new(lookup),
        }
    }

    pub fn set_hosts(&self, hosts: Hosts) {
        *self.hosts.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(hosts);
    }

    pub fn hosts(&self) -> Arc<Hosts> {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Static host table lookup.
    pub fn search_host(&self, host: &str) -> Option<IpAddr> {
        self.hosts().search(host)
    }

    pub fn set_external(&self, resolver: Option<Arc<dyn Resolver>>) {
        *self.external.write().unwrap_or_else(PoisonError::into_inner) = resolver;
    }

    pub fn external(&self) -> Option<Arc<dyn Resolver>> {
        self.external.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_disable_ipv6(&self, disable: bool) {
        self.disable_ipv6.store(disable, Ordering::Relaxed);
    }

    pub fn ipv6_disabled(&self) -> bool {
        self.disable_ipv6.load(Ordering::Relaxed)
    }

    /// Resolve `host` to an IPv4 address.
    pub async fn resolve_ipv4(&self, host: &str) -> Result<IpAddr> {
        if let Some(ip) = self.search_host(host).and_then(as_ipv4) {
            return Ok(ip);
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return as_ipv4_literal(ip).ok_or(Error::IpVersion);
        }

        if let Some(resolver) = self.external() {
            return resolver.resolve_ipv4(host).await;
        }

        self.cache
            .resolve(host, Family::V4)
            .await
            .map_err(Error::Lookup)?
            .ok_or(Error::IpNotFound)
    }

    /// Resolve `host` to an IPv6 address. Fails at once when IPv6 is disabled.
    pub async fn resolve_ipv6(&self, host: &str) -> Result<IpAddr> {
        if self.ipv6_disabled() {
            return Err(Error::Ipv6Disabled);
        }

        if let Some(ip) = self.search_host(host).filter(IpAddr::is_ipv6) {
            return Ok(ip);
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V6(_) => Ok(ip),
                IpAddr::V4(_) => Err(Error::IpVersion),
            };
        }

        if let Some(resolver) = self.external() {
            return resolver.resolve_ipv6(host).await;
        }

        self.cache
            .resolve(host, Family::V6)
            .await
            .map_err(Error::Lookup)?
            .ok_or(Error::IpNotFound)
    }

    /// Resolve `host` to an address of any family IPv6 policy allows.
    pub async fn resolve_ip(&self, host: &str) -> Result<IpAddr> {
        if let Some(ip) = self.search_host(host) {
            return Ok(ip);
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(resolver) = self.external() {
            if self.ipv6_disabled() {
                return resolver.resolve_ipv4(host).await;
            }
            return resolver.resolve_ip(host).await;
        }

        if self.ipv6_disabled() {
            return self.resolve_ipv4(host).await;
        }

        self.cache
            .resolve(host, Family::Any)
            .await
            .map_err(Error::Lookup)?
            .ok_or(Error::IpNotFound)
    }

    /// An external resolver is installed that can map addresses back to hosts.
    pub fn mapping_enabled(&self) -> bool {
        self.external()
            .is_some_and(|r| r.is_mapping() || r.fake_ip_enabled())
    }

    pub fn fake_ip_enabled(&self) -> bool {
        self.external().is_some_and(|r| r.fake_ip_enabled())
    }

    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        self.external().is_some_and(|r| r.is_fake_ip(ip))
    }

    pub fn is_exist_fake_ip(&self, ip: IpAddr) -> bool {
        self.external().is_some_and(|r| r.is_exist_fake_ip(ip))
    }

    pub fn find_host_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.external().and_then(|r| r.find_host_by_ip(ip))
    }
}

impl Default for Dns {
    fn default() -> Self {
        Self::new()
    }
}

/// Table entries are filtered by family; mapped IPv6 forms count as IPv4.
fn as_ipv4(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(_) => Some(ip),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
    }
}

/// Literals are judged by how they were written, so `::ffff:1.2.3.4` is IPv6.
fn as_ipv4_literal(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(_) => Some(ip),
        IpAddr::V6(_) => None,
    }
}
