//! Hostname resolution memo.
//!
//! Entries never expire on their own; call [`DnsCache::invalidate`] when an
//! address is known to be stale. The map lock is never held across a lookup,
//! so two threads missing on the same host may both resolve it and the last
//! write wins.
use std::{
    collections::HashMap,
    io,
    net::{IpAddr, ToSocketAddrs},
};

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{ResolveError, Result};

pub trait Resolve {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

impl<F> Resolve for F
where
    F: Fn(&str) -> io::Result<Vec<IpAddr>>,
{
    #[inline]
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        (self)(host)
    }
}

/// Resolves through the operating system, IPv4 addresses first.
#[derive(Default, Clone, Copy, Debug)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in (host, 0).to_socket_addrs()? {
            if !addrs.contains(&addr.ip()) {
                addrs.push(addr.ip());
            }
        }
        addrs.sort_by_key(|ip| ip.is_ipv6());
        Ok(addrs)
    }
}

/// The address of a host written as an IP literal, `[v6]` included.
pub fn ip_literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

#[derive(Debug, Default)]
pub struct DnsCache<R = SystemResolver> {
    resolver: R,
    cache: Mutex<HashMap<SmolStr, Vec<IpAddr>>>,
}

impl DnsCache {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: Resolve> DnsCache<R> {
    pub fn with_resolver(resolver: R) -> Self {
        Self {
            resolver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Addresses for `host`, resolving and caching them on a miss.
    pub fn get(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(addrs) = self.cache.lock().get(host) {
            return Ok(addrs.clone());
        }

        #[cfg(feature = "logging")]
        tracing::debug!("dns cache miss for {}", host);
        let addrs = self
            .resolver
            .resolve(host)
            .map_err(|source| ResolveError::Lookup {
                host: host.to_owned(),
                source,
            })?;
        if addrs.is_empty() {
            return Err(ResolveError::NoResolve(host.to_owned()).into());
        }

        self.cache.lock().insert(SmolStr::new(host), addrs.clone());
        Ok(addrs)
    }

    /// The address a connection to `host` should use.
    pub fn first(&self, host: &str) -> Result<IpAddr> {
        self.get(host)?
            .first()
            .copied()
            .ok_or_else(|| ResolveError::NoResolve(host.to_owned()).into())
    }

    /// Overwrite the entry for `host`.
    pub fn set(&self, host: &str, addrs: Vec<IpAddr>) {
        self.cache.lock().insert(SmolStr::new(host), addrs);
    }

    pub fn invalidate(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.cache.lock().remove(host)
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn contains(&self, host: &str) -> bool {
        self.cache.lock().contains_key(host)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, Ipv6Addr},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use super::*;
    use crate::TransportError;

    fn counting(calls: Arc<AtomicUsize>) -> impl Fn(&str) -> io::Result<Vec<IpAddr>> {
        move |host: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            match host {
                "nowhere.test" => Err(io::Error::new(io::ErrorKind::NotFound, "no such host")),
                "empty.test" => Ok(Vec::new()),
                _ => Ok(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]),
            }
        }
    }

    #[test]
    fn literals_bypass_lookup() {
        assert_eq!(
            ip_literal("127.0.0.1"),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(ip_literal("[::1]"), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(ip_literal("localhost"), None);
    }

    #[test]
    fn resolves_localhost() {
        let dns = DnsCache::new();
        let addrs = dns.get("localhost").unwrap();
        assert_eq!(addrs[0], IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(dns.contains("localhost"));
        assert_eq!(dns.get("localhost").unwrap(), addrs);
    }

    #[test]
    fn miss_resolves_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dns = DnsCache::with_resolver(counting(calls.clone()));
        let first = dns.get("example.test").unwrap();
        let second = dns.get("example.test").unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dns.len(), 1);
    }

    #[test]
    fn set_overwrites() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dns = DnsCache::with_resolver(counting(calls.clone()));
        dns.get("example.test").unwrap();
        let pinned = vec![
            IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 1, 1, 2)),
        ];
        dns.set("example.test", pinned.clone());
        assert_eq!(dns.get("example.test").unwrap(), pinned);
        assert_eq!(dns.first("example.test").unwrap(), pinned[0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_forces_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dns = DnsCache::with_resolver(counting(calls.clone()));
        dns.get("example.test").unwrap();
        assert!(dns.invalidate("example.test").is_some());
        assert!(!dns.contains("example.test"));
        dns.get("example.test").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        dns.clear();
        assert!(dns.is_empty());
    }

    #[test]
    fn failures_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dns = DnsCache::with_resolver(counting(calls.clone()));
        assert!(matches!(
            dns.get("nowhere.test"),
            Err(TransportError::Resolve(ResolveError::Lookup { .. }))
        ));
        assert!(matches!(
            dns.get("empty.test"),
            Err(TransportError::Resolve(ResolveError::NoResolve(_)))
        ));
        assert!(dns.is_empty());
    }

    #[test]
    fn shared_across_threads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dns = Arc::new(DnsCache::with_resolver(counting(calls.clone())));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let dns = dns.clone();
                thread::spawn(move || dns.get(&format!("host{}.test", i % 4)).unwrap())
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap().len(), 1);
        }
        assert_eq!(dns.len(), 4);
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }
}
