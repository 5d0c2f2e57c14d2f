//! Common types for merel

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Email address split into localpart and domain.
///
/// The domain is kept lowercase; the localpart keeps its original case but
/// compares and canonicalizes case-insensitively, which is how the store
/// resolves destinations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub localpart: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address. The domain is lowercased.
    pub fn new(localpart: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            localpart: localpart.into(),
            domain: domain.into().to_lowercase(),
        }
    }

    /// Parse an email address from a string, accepting an optional
    /// `<...>` wrapper as seen in envelopes and message headers.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>');
        let at = s.rfind('@')?;
        let (local, domain) = (&s[..at], &s[at + 1..]);
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }

    /// Canonical form used for destination lookup and subjectpass keys:
    /// lowercased localpart and domain.
    pub fn canonical(&self) -> String {
        format!("{}@{}", self.localpart.to_lowercase(), self.domain)
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.localpart, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Message flags, IMAP system flags plus the merel-specific set that feeds
/// reputation and junk filter training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageFlags {
    pub seen: bool,
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub draft: bool,
    pub junk: bool,
    pub notjunk: bool,
    pub forwarded: bool,
    pub phishing: bool,
    pub mdnsent: bool,
}

impl MessageFlags {
    /// A message only counts for reputation and training when the user (or
    /// the analyzer) expressed an opinion.
    pub fn has_junk_opinion(&self) -> bool {
        self.junk || self.notjunk
    }
}

/// Result of SPF validation of the SMTP MAIL FROM address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    #[default]
    None,
    Pass,
    Neutral,
    Softfail,
    Fail,
    Temperror,
    Permerror,
}

impl Validation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Validation::None => "none",
            Validation::Pass => "pass",
            Validation::Neutral => "neutral",
            Validation::Softfail => "softfail",
            Validation::Fail => "fail",
            Validation::Temperror => "temperror",
            Validation::Permerror => "permerror",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Validation::None),
            "pass" => Some(Validation::Pass),
            "neutral" => Some(Validation::Neutral),
            "softfail" => Some(Validation::Softfail),
            "fail" => Some(Validation::Fail),
            "temperror" => Some(Validation::Temperror),
            "permerror" => Some(Validation::Permerror),
            _ => None,
        }
    }
}

/// How the message From-header domain was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FromValidation {
    #[default]
    None,
    /// DKIM signature directly from the From domain.
    Strict,
    /// DKIM signature from an organizationally aligned domain.
    Relaxed,
    /// DMARC evaluation passed.
    Dmarc,
}

impl FromValidation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FromValidation::None => "none",
            FromValidation::Strict => "strict",
            FromValidation::Relaxed => "relaxed",
            FromValidation::Dmarc => "dmarc",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "none" => Some(FromValidation::None),
            "strict" => Some(FromValidation::Strict),
            "relaxed" => Some(FromValidation::Relaxed),
            "dmarc" => Some(FromValidation::Dmarc),
            _ => None,
        }
    }
}

/// Masked variants of a remote IP, used as coarse reputation buckets.
///
/// For IPv4 the three levels are /32, /24 and /16 with the trailing bytes
/// zeroed; for IPv6 they are /64, /48 and /32.
pub fn masked_ips(ip: IpAddr) -> (String, String, String) {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            (
                format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3]),
                format!("{}.{}.{}.0", o[0], o[1], o[2]),
                format!("{}.{}.0.0", o[0], o[1]),
            )
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = |prefix: u32| {
                let masked = bits & (u128::MAX << (128 - prefix));
                std::net::Ipv6Addr::from(masked).to_string()
            };
            (mask(64), mask(48), mask(32))
        }
    }
}

/// Organizational domain: the registrable part of a DNS name.
///
/// Heuristic of keeping the last two labels; a full implementation would
/// consult the Public Suffix List.
pub fn organizational_domain(domain: &str) -> String {
    let domain = domain.to_lowercase();
    let parts: Vec<&str> = domain.split('.').collect();
    if parts.len() > 2 {
        parts[parts.len() - 2..].join(".")
    } else {
        domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@Example.COM").unwrap();
        assert_eq!(email.localpart, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");

        let email = EmailAddress::parse("<User@example.org>").unwrap();
        assert_eq!(email.localpart, "User");
        assert_eq!(email.canonical(), "user@example.org");
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
    }

    #[test]
    fn test_masked_ips_v4() {
        let (m1, m2, m3) = masked_ips("10.20.30.40".parse().unwrap());
        assert_eq!(m1, "10.20.30.40");
        assert_eq!(m2, "10.20.30.0");
        assert_eq!(m3, "10.20.0.0");
    }

    #[test]
    fn test_masked_ips_v6() {
        let (m1, m2, m3) = masked_ips("2001:db8:1:2:3:4:5:6".parse().unwrap());
        assert_eq!(m1, "2001:db8:1:2::");
        assert_eq!(m2, "2001:db8:1::");
        assert_eq!(m3, "2001:db8::");
    }

    #[test]
    fn test_organizational_domain() {
        assert_eq!(organizational_domain("mail.example.com"), "example.com");
        assert_eq!(organizational_domain("example.com"), "example.com");
        assert_eq!(organizational_domain("EXAMPLE.com"), "example.com");
    }
}
