//! Forward-confirmed reverse DNS (iprev, RFC 8601 §2.7.3).
//!
//! The client IP must have a PTR record whose name resolves back to that
//! same IP. Senders without working reverse DNS are disproportionately
//! spam sources; the analysis uses a failing iprev as an amplifier.

use std::net::IpAddr;

use merel_common::dns::Resolver;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IprevStatus {
    /// A PTR name resolves back to the client IP.
    Pass,
    /// PTR missing, or no PTR name resolves back to the IP.
    Fail,
    /// DNS trouble; inconclusive.
    TempError,
}

impl IprevStatus {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            IprevStatus::Pass => "pass",
            IprevStatus::Fail => "fail",
            IprevStatus::TempError => "temperror",
        }
    }
}

/// At most this many PTR names are forward-confirmed.
const MAX_PTR_NAMES: usize = 10;

pub async fn verify(resolver: &dyn Resolver, ip: IpAddr) -> IprevStatus {
    let names = match resolver.lookup_ptr(ip).await {
        Ok(names) => names,
        Err(e) if e.is_not_found() => {
            debug!(%ip, "no ptr record");
            return IprevStatus::Fail;
        }
        Err(e) => {
            debug!(%ip, error = %e, "ptr lookup");
            return IprevStatus::TempError;
        }
    };

    let mut temp = false;
    for name in names.iter().take(MAX_PTR_NAMES) {
        match resolver.lookup_ip(name).await {
            Ok(ips) if ips.contains(&ip) => return IprevStatus::Pass,
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(_) => temp = true,
        }
    }
    if temp {
        IprevStatus::TempError
    } else {
        IprevStatus::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merel_common::dns::StubResolver;

    #[tokio::test]
    async fn test_forward_confirmed() {
        let ip: IpAddr = "127.0.0.10".parse().unwrap();
        let mut r = StubResolver::new();
        r.add_ptr(ip, "example.org");
        r.add_a("example.org", "127.0.0.10".parse().unwrap());
        assert_eq!(verify(&r, ip).await, IprevStatus::Pass);
    }

    #[tokio::test]
    async fn test_ptr_points_elsewhere() {
        let ip: IpAddr = "127.0.0.10".parse().unwrap();
        let mut r = StubResolver::new();
        r.add_ptr(ip, "example.org");
        r.add_a("example.org", "10.9.9.9".parse().unwrap());
        assert_eq!(verify(&r, ip).await, IprevStatus::Fail);
    }

    #[tokio::test]
    async fn test_no_ptr() {
        let ip: IpAddr = "127.0.0.10".parse().unwrap();
        let r = StubResolver::new();
        assert_eq!(verify(&r, ip).await, IprevStatus::Fail);
    }

    #[tokio::test]
    async fn test_forward_lookup_failure_is_temperror() {
        let ip: IpAddr = "127.0.0.10".parse().unwrap();
        let mut r = StubResolver::new();
        r.add_ptr(ip, "broken.example");
        r.fail.insert("broken.example".to_string());
        assert_eq!(verify(&r, ip).await, IprevStatus::TempError);
    }
}
