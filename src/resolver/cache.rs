//! Per-host lookup cache with background refresh.

use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

/// Entries older than this are refreshed before answering.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Minimum spacing between two lookups for the same host.
pub const REFRESH_DEBOUNCE: Duration = Duration::from_secs(3);

/// Multi-address host lookup.
#[async_trait]
pub trait Lookup: Send + Sync + 'static {
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Lookup through the operating system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup_ip(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Address family requested from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    Any,
}

#[derive(Debug, Default)]
struct Record {
    refreshed_at: Option<Instant>,
    ipv4: Option<IpAddr>,
    ipv6: Option<IpAddr>,
    /// First address of the same multi-address answer; there is no separate
    /// family-agnostic lookup.
    any: Option<IpAddr>,
    refreshing: bool,
}

struct HostEntry {
    host: String,
    record: Mutex<Record>,
}

impl HostEntry {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            record: Mutex::new(Record::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        let now = Instant::now();
        self.lock()
            .refreshed_at
            .is_none_or(|at| now.duration_since(at) >= stale_after)
    }

    fn get(&self, family: Family) -> Option<IpAddr> {
        let record = self.lock();
        match family {
            Family::V4 => record.ipv4,
            Family::V6 => record.ipv6,
            Family::Any => record.any,
        }
    }
}

/// Clears the in-flight flag even if the refresh future is dropped mid-lookup.
struct RefreshGuard<'a> {
    entry: &'a HostEntry,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let mut record = self.entry.lock();
        record.refreshing = false;
        record.refreshed_at = Some(Instant::now());
    }
}

/// Look the host up again unless a refresh is running or ran recently.
///
/// A skipped refresh reports success and leaves the entry untouched. A failed
/// lookup keeps the previous addresses.
async fn refresh(entry: &HostEntry, lookup: &dyn Lookup, debounce: Duration) -> io::Result<()> {
    {
        let mut record = entry.lock();
        let now = Instant::now();
        let recent = record
            .refreshed_at
            .is_some_and(|at| now.duration_since(at) < debounce);
        if record.refreshing || recent {
            return Ok(());
        }
        record.refreshing = true;
        record.refreshed_at = Some(now);
    }
    let _guard = RefreshGuard { entry };

    let addrs = lookup.lookup_ip(&entry.host).await?;

    let mut record = entry.lock();
    if let Some(ip) = addrs.iter().find(|ip| is_ipv4(ip)) {
        record.ipv4 = Some(*ip);
    }
    if let Some(ip) = addrs.iter().find(|ip| !is_ipv4(ip)) {
        record.ipv6 = Some(*ip);
    }
    if let Some(ip) = addrs.first() {
        record.any = Some(*ip);
    }
    Ok(())
}

/// IPv4, including IPv4-mapped IPv6 addresses.
fn is_ipv4(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
    }
}

fn to_family(ip: IpAddr, family: Family) -> IpAddr {
    match (family, ip) {
        (Family::V4, IpAddr::V6(v6)) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        _ => ip,
    }
}

/// Host resolver cache.
///
/// One entry per hostname, created on first use and never evicted. Each entry
/// carries its own lock so unrelated hosts never contend.
pub struct ResolverCache {
    entries: RwLock<FxHashMap<String, Arc<HostEntry>>>,
    lookup: Arc<dyn Lookup>,
    stale_after: Duration,
    debounce: Duration,
}

impl ResolverCache {
    pub fn new(lookup: Arc<dyn Lookup>) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            lookup,
            stale_after: STALE_AFTER,
            debounce: REFRESH_DEBOUNCE,
        }
    }

    fn entry(&self, host: &str) -> Arc<HostEntry> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(host) {
                return entry.clone();
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostEntry::new(host)))
            .clone()
    }

    /// Resolve `host` to an address of `family`.
    ///
    /// Stale entries are refreshed before answering and the lookup error, if
    /// any, is returned. Fresh entries answer immediately and schedule a
    /// detached refresh whose outcome only lands in the cache.
    pub async fn resolve(&self, host: &str, family: Family) -> io::Result<Option<IpAddr>> {
        let entry = self.entry(host);

        if entry.is_stale(self.stale_after) {
            refresh(&entry, self.lookup.as_ref(), self.debounce).await?;
        } else {
            let entry = entry.clone();
            let lookup = self.lookup.clone();
            let debounce = self.debounce;
            tokio::spawn(async move {
                if let Err(e) = refresh(&entry, lookup.as_ref(), debounce).await {
                    debug!("[DNS] background refresh of {} failed: {}", entry.host, e);
                }
            });
        }

        Ok(entry.get(family).map(|ip| to_family(ip, family)))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted answers and counts calls.
    #[derive(Default)]
    pub(crate) struct ScriptedLookup {
        pub calls: AtomicUsize,
        answers: Mutex<VecDeque<io::Result<Vec<IpAddr>>>>,
        fallback: Vec<IpAddr>,
    }

    impl ScriptedLookup {
        pub(crate) fn always(addrs: &[&str]) -> Self {
            Self {
                fallback: addrs.iter().map(|a| a.parse().unwrap()).collect(),
                ..Self::default()
            }
        }

        pub(crate) fn push(&self, answer: io::Result<Vec<IpAddr>>) {
            self.answers.lock().unwrap().push_back(answer);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Lookup for ScriptedLookup {
        async fn lookup_ip(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.lock().unwrap().pop_front() {
                Some(answer) => answer,
                None => Ok(self.fallback.clone()),
            }
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_resolve_is_synchronous() {
        let lookup = Arc::new(ScriptedLookup::always(&["2001:db8::1", "1.2.3.4", "5.6.7.8"]));
        let cache = ResolverCache::new(lookup.clone());

        assert_eq!(cache.resolve("a.test", Family::V4).await.unwrap(), Some(ip("1.2.3.4")));
        assert_eq!(cache.resolve("a.test", Family::V6).await.unwrap(), Some(ip("2001:db8::1")));
        assert_eq!(cache.resolve("a.test", Family::Any).await.unwrap(), Some(ip("2001:db8::1")));
        assert_eq!(lookup.calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entry_answers_from_cache_and_refreshes_in_background() {
        let lookup = Arc::new(ScriptedLookup::default());
        lookup.push(Ok(vec![ip("1.1.1.1")]));
        lookup.push(Ok(vec![ip("2.2.2.2")]));
        let cache = ResolverCache::new(lookup.clone());

        assert_eq!(cache.resolve("a.test", Family::V4).await.unwrap(), Some(ip("1.1.1.1")));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.resolve("a.test", Family::V4).await.unwrap(), Some(ip("1.1.1.1")));
        settle().await;

        assert_eq!(lookup.calls(), 2);
        assert_eq!(cache.resolve("a.test", Family::V4).await.unwrap(), Some(ip("2.2.2.2")));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_blocks_on_lookup() {
        let lookup = Arc::new(ScriptedLookup::default());
        lookup.push(Ok(vec![ip("1.1.1.1")]));
        lookup.push(Ok(vec![ip("3.3.3.3")]));
        let cache = ResolverCache::new(lookup.clone());

        cache.resolve("a.test", Family::V4).await.unwrap();
        tokio::time::advance(STALE_AFTER).await;

        assert_eq!(cache.resolve("a.test", Family::V4).await.unwrap(), Some(ip("3.3.3.3")));
        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_within_debounce_window_are_skipped() {
        let lookup = Arc::new(ScriptedLookup::always(&["1.1.1.1"]));
        let cache = ResolverCache::new(lookup.clone());

        cache.resolve("a.test", Family::V4).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.resolve("a.test", Family::V4).await.unwrap();
        settle().await;

        assert_eq!(lookup.calls(), 1);

        tokio::time::advance(REFRESH_DEBOUNCE).await;
        cache.resolve("a.test", Family::V4).await.unwrap();
        settle().await;

        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lookup_error_is_returned_and_values_kept() {
        let lookup = Arc::new(ScriptedLookup::default());
        lookup.push(Ok(vec![ip("1.1.1.1")]));
        lookup.push(Err(io::Error::other("servfail")));
        let cache = ResolverCache::new(lookup.clone());

        cache.resolve("a.test", Family::V4).await.unwrap();
        tokio::time::advance(STALE_AFTER).await;

        assert!(cache.resolve("a.test", Family::V4).await.is_err());
        assert_eq!(cache.resolve("a.test", Family::V4).await.unwrap(), Some(ip("1.1.1.1")));
    }

    #[tokio::test(start_paused = true)]
    async fn families_are_extracted_independently() {
        let lookup = Arc::new(ScriptedLookup::default());
        lookup.push(Ok(vec![ip("1.1.1.1")]));
        lookup.push(Ok(vec![ip("2001:db8::2")]));
        let cache = ResolverCache::new(lookup.clone());

        cache.resolve("a.test", Family::V4).await.unwrap();
        tokio::time::advance(STALE_AFTER).await;

        assert_eq!(cache.resolve("a.test", Family::V6).await.unwrap(), Some(ip("2001:db8::2")));
        assert_eq!(cache.resolve("a.test", Family::V4).await.unwrap(), Some(ip("1.1.1.1")));
    }

    #[test]
    fn mapped_addresses_count_as_ipv4() {
        assert!(is_ipv4(&ip("::ffff:1.2.3.4")));
        assert!(!is_ipv4(&ip("2001:db8::1")));
        assert_eq!(to_family(ip("::ffff:1.2.3.4"), Family::V4), ip("1.2.3.4"));
    }
}
