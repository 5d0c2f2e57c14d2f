//! DNS resolver abstraction.
//!
//! The core never talks to a concrete resolver: evaluators and the queue
//! take a [`Resolver`] so tests run against [`StubResolver`] and production
//! wires in [`SystemResolver`] on top of trust-dns. Not-found (NXDOMAIN or
//! an empty answer) is a distinct condition from a lookup failure because
//! several protocols (MTA-STS CNAME chasing, DNSBL health checks) branch
//! on it.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use thiserror::Error;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::proto::rr::{RData, RecordType};
use trust_dns_resolver::TokioAsyncResolver;

/// DNS lookup error.
#[derive(Debug, Clone, Error)]
pub enum DnsError {
    /// NXDOMAIN or no records of the requested type.
    #[error("name not found")]
    NotFound,
    /// Temporary failure: timeouts, servfail, transport trouble.
    #[error("dns lookup: {0}")]
    Lookup(String),
}

impl DnsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DnsError::NotFound)
    }
}

pub type DnsResult<T> = std::result::Result<T, DnsError>;

/// An MX record: preference and exchange host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub host: String,
}

/// Abstract DNS resolver used throughout the core.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>>;
    async fn lookup_ipv4(&self, name: &str) -> DnsResult<Vec<Ipv4Addr>>;
    async fn lookup_ipv6(&self, name: &str) -> DnsResult<Vec<Ipv6Addr>>;
    /// MX records sorted by preference, most preferred first.
    async fn lookup_mx(&self, name: &str) -> DnsResult<Vec<MxRecord>>;
    /// PTR names for the given address.
    async fn lookup_ptr(&self, ip: IpAddr) -> DnsResult<Vec<String>>;
    /// The CNAME target of a name, if any.
    async fn lookup_cname(&self, name: &str) -> DnsResult<Option<String>>;

    /// Combined A and AAAA lookup. Not-found only when both are absent.
    async fn lookup_ip(&self, name: &str) -> DnsResult<Vec<IpAddr>> {
        let mut ips: Vec<IpAddr> = Vec::new();
        let v4 = self.lookup_ipv4(name).await;
        let v6 = self.lookup_ipv6(name).await;
        match (&v4, &v6) {
            (Err(DnsError::Lookup(e)), _) | (_, Err(DnsError::Lookup(e))) => {
                return Err(DnsError::Lookup(e.clone()))
            }
            (Err(DnsError::NotFound), Err(DnsError::NotFound)) => return Err(DnsError::NotFound),
            _ => {}
        }
        if let Ok(v) = v4 {
            ips.extend(v.into_iter().map(IpAddr::V4));
        }
        if let Ok(v) = v6 {
            ips.extend(v.into_iter().map(IpAddr::V6));
        }
        Ok(ips)
    }
}

fn map_resolve_error(e: trust_dns_resolver::error::ResolveError) -> DnsError {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
        _ => DnsError::Lookup(e.to_string()),
    }
}

/// Production resolver backed by trust-dns with the system configuration.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }

    pub fn with_resolver(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        let lookup = self.resolver.txt_lookup(name).await.map_err(map_resolve_error)?;
        Ok(lookup
            .iter()
            .map(|r| {
                r.txt_data()
                    .iter()
                    .map(|d| String::from_utf8_lossy(d))
                    .collect::<String>()
            })
            .collect())
    }

    async fn lookup_ipv4(&self, name: &str) -> DnsResult<Vec<Ipv4Addr>> {
        let lookup = self.resolver.ipv4_lookup(name).await.map_err(map_resolve_error)?;
        Ok(lookup.iter().map(|r| (*r).into()).collect())
    }

    async fn lookup_ipv6(&self, name: &str) -> DnsResult<Vec<Ipv6Addr>> {
        let lookup = self.resolver.ipv6_lookup(name).await.map_err(map_resolve_error)?;
        Ok(lookup.iter().map(|r| (*r).into()).collect())
    }

    async fn lookup_mx(&self, name: &str) -> DnsResult<Vec<MxRecord>> {
        let lookup = self.resolver.mx_lookup(name).await.map_err(map_resolve_error)?;
        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|r| MxRecord {
                preference: r.preference(),
                host: normalize_name(&r.exchange().to_string()),
            })
            .collect();
        records.sort_by_key(|r| r.preference);
        Ok(records)
    }

    async fn lookup_ptr(&self, ip: IpAddr) -> DnsResult<Vec<String>> {
        let lookup = self.resolver.reverse_lookup(ip).await.map_err(map_resolve_error)?;
        Ok(lookup
            .iter()
            .map(|name| normalize_name(&name.to_string()))
            .collect())
    }

    async fn lookup_cname(&self, name: &str) -> DnsResult<Option<String>> {
        let lookup = self
            .resolver
            .lookup(name, RecordType::CNAME)
            .await
            .map_err(map_resolve_error)?;
        for rdata in lookup.iter() {
            if let RData::CNAME(target) = rdata {
                return Ok(Some(normalize_name(&target.to_string())));
            }
        }
        Ok(None)
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// In-memory resolver for tests. Names are stored normalized (lowercase,
/// no trailing dot); names listed in `fail` return a temporary error.
#[derive(Default)]
pub struct StubResolver {
    pub txt: HashMap<String, Vec<String>>,
    pub a: HashMap<String, Vec<Ipv4Addr>>,
    pub aaaa: HashMap<String, Vec<Ipv6Addr>>,
    pub mx: HashMap<String, Vec<MxRecord>>,
    pub ptr: HashMap<String, Vec<String>>,
    pub cname: HashMap<String, String>,
    pub fail: HashSet<String>,
}

impl StubResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt(&mut self, name: &str, value: &str) {
        self.txt
            .entry(normalize_name(name))
            .or_default()
            .push(value.to_string());
    }

    pub fn add_a(&mut self, name: &str, ip: Ipv4Addr) {
        self.a.entry(normalize_name(name)).or_default().push(ip);
    }

    pub fn add_mx(&mut self, name: &str, preference: u16, host: &str) {
        self.mx.entry(normalize_name(name)).or_default().push(MxRecord {
            preference,
            host: normalize_name(host),
        });
    }

    pub fn add_ptr(&mut self, ip: IpAddr, name: &str) {
        self.ptr
            .entry(ip.to_string())
            .or_default()
            .push(normalize_name(name));
    }

    pub fn add_cname(&mut self, name: &str, target: &str) {
        self.cname
            .insert(normalize_name(name), normalize_name(target));
    }

    fn check_fail(&self, name: &str) -> DnsResult<()> {
        if self.fail.contains(name) {
            return Err(DnsError::Lookup("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Resolver for StubResolver {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        let name = normalize_name(name);
        self.check_fail(&name)?;
        self.txt.get(&name).cloned().ok_or(DnsError::NotFound)
    }

    async fn lookup_ipv4(&self, name: &str) -> DnsResult<Vec<Ipv4Addr>> {
        let name = normalize_name(name);
        self.check_fail(&name)?;
        self.a.get(&name).cloned().ok_or(DnsError::NotFound)
    }

    async fn lookup_ipv6(&self, name: &str) -> DnsResult<Vec<Ipv6Addr>> {
        let name = normalize_name(name);
        self.check_fail(&name)?;
        self.aaaa.get(&name).cloned().ok_or(DnsError::NotFound)
    }

    async fn lookup_mx(&self, name: &str) -> DnsResult<Vec<MxRecord>> {
        let name = normalize_name(name);
        self.check_fail(&name)?;
        let mut records = self.mx.get(&name).cloned().ok_or(DnsError::NotFound)?;
        records.sort_by_key(|r| r.preference);
        Ok(records)
    }

    async fn lookup_ptr(&self, ip: IpAddr) -> DnsResult<Vec<String>> {
        self.ptr.get(&ip.to_string()).cloned().ok_or(DnsError::NotFound)
    }

    async fn lookup_cname(&self, name: &str) -> DnsResult<Option<String>> {
        let name = normalize_name(name);
        self.check_fail(&name)?;
        Ok(self.cname.get(&name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_resolver() {
        let mut r = StubResolver::new();
        r.add_txt("example.com", "v=spf1 -all");
        r.add_a("mail.example.com", "127.0.0.10".parse().unwrap());
        r.add_mx("example.com", 10, "mail.example.com.");

        assert_eq!(
            r.lookup_txt("Example.COM.").await.unwrap(),
            vec!["v=spf1 -all".to_string()]
        );
        assert!(r.lookup_txt("other.example").await.unwrap_err().is_not_found());

        let mx = r.lookup_mx("example.com").await.unwrap();
        assert_eq!(mx[0].host, "mail.example.com");

        let ips = r.lookup_ip("mail.example.com").await.unwrap();
        assert_eq!(ips, vec!["127.0.0.10".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_stub_resolver_injected_failure() {
        let mut r = StubResolver::new();
        r.fail.insert("broken.example".to_string());
        let err = r.lookup_txt("broken.example").await.unwrap_err();
        assert!(!err.is_not_found());
    }
}
