//! DNS blocklist lookups with health checking.
//!
//! A zone is only consulted when it behaves: the well-known test address
//! 127.0.0.2 must be listed and 127.0.0.1 must not be. Zones that list
//! everything (e.g. a lapsed blocklist wildcarding its domain) would
//! otherwise reject all mail. Lookups carry their own 30 second deadline
//! regardless of the caller's.

use std::net::IpAddr;
use std::time::Duration;

use merel_common::dns::Resolver;
use tracing::{debug, info};

/// Inner deadline for a single zone lookup or health probe.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsblStatus {
    /// Not listed.
    Pass,
    /// Listed.
    Fail,
    /// DNS trouble; inconclusive.
    TempError,
}

/// Look up an IP in a blocklist zone. On a listing, the TXT explanation is
/// returned when the zone serves one.
pub async fn lookup(resolver: &dyn Resolver, zone: &str, ip: IpAddr) -> (DnsblStatus, Option<String>) {
    let name = format!("{}.{}", reverse_address(ip), zone);
    let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, resolver.lookup_ipv4(&name)).await;
    match lookup {
        Ok(Ok(ips)) if !ips.is_empty() => {
            let expl = tokio::time::timeout(LOOKUP_TIMEOUT, resolver.lookup_txt(&name))
                .await
                .ok()
                .and_then(|r| r.ok())
                .and_then(|txts| txts.into_iter().next());
            debug!(zone, %ip, "listed in dnsbl");
            (DnsblStatus::Fail, expl)
        }
        Ok(Ok(_)) => (DnsblStatus::Pass, None),
        Ok(Err(e)) if e.is_not_found() => (DnsblStatus::Pass, None),
        Ok(Err(e)) => {
            debug!(zone, %ip, error = %e, "dnsbl lookup");
            (DnsblStatus::TempError, None)
        }
        Err(_) => {
            debug!(zone, %ip, "dnsbl lookup timeout");
            (DnsblStatus::TempError, None)
        }
    }
}

/// Whether a zone is answering sanely: 127.0.0.2 listed, 127.0.0.1 not.
pub async fn check_health(resolver: &dyn Resolver, zone: &str) -> bool {
    let (listed, _) = lookup(resolver, zone, IpAddr::from([127, 0, 0, 2])).await;
    if listed != DnsblStatus::Fail {
        info!(zone, "dnsbl does not list 127.0.0.2, unhealthy");
        return false;
    }
    let (unlisted, _) = lookup(resolver, zone, IpAddr::from([127, 0, 0, 1])).await;
    if unlisted != DnsblStatus::Pass {
        info!(zone, "dnsbl lists 127.0.0.1, unhealthy");
        return false;
    }
    true
}

/// The reversed address labels used as a query prefix.
fn reverse_address(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut labels = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0x0f));
                labels.push(format!("{:x}", byte >> 4));
            }
            labels.join(".")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merel_common::dns::StubResolver;

    fn healthy_zone(r: &mut StubResolver, zone: &str) {
        r.add_a(&format!("2.0.0.127.{}", zone), "127.0.0.2".parse().unwrap());
    }

    #[test]
    fn test_reverse_address() {
        assert_eq!(reverse_address("10.0.0.127".parse().unwrap()), "127.0.0.10");
        let v6 = reverse_address("2001:db8::1".parse().unwrap());
        assert!(v6.starts_with("1.0.0.0."));
        assert!(v6.ends_with("8.b.d.0.1.0.0.2"));
    }

    #[tokio::test]
    async fn test_lookup_listed() {
        let mut r = StubResolver::new();
        r.add_a("10.0.0.127.dnsbl.example", "127.0.0.2".parse().unwrap());
        r.add_txt("10.0.0.127.dnsbl.example", "spam source, see example");

        let (status, expl) = lookup(&r, "dnsbl.example", "127.0.0.10".parse().unwrap()).await;
        assert_eq!(status, DnsblStatus::Fail);
        assert_eq!(expl.as_deref(), Some("spam source, see example"));
    }

    #[tokio::test]
    async fn test_lookup_unlisted() {
        let r = StubResolver::new();
        let (status, _) = lookup(&r, "dnsbl.example", "127.0.0.10".parse().unwrap()).await;
        assert_eq!(status, DnsblStatus::Pass);
    }

    #[tokio::test]
    async fn test_health() {
        let mut r = StubResolver::new();
        assert!(!check_health(&r, "dnsbl.example").await);

        healthy_zone(&mut r, "dnsbl.example");
        assert!(check_health(&r, "dnsbl.example").await);

        // A zone listing 127.0.0.1 lists everything; unhealthy.
        r.add_a("1.0.0.127.dnsbl.example", "127.0.0.2".parse().unwrap());
        assert!(!check_health(&r, "dnsbl.example").await);
    }
}
