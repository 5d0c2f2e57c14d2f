//! SPF (Sender Policy Framework) verification
//!
//! Implements RFC 7208 - Sender Policy Framework (SPF) for Authorizing Use of Domains in Email

use std::net::IpAddr;

use anyhow::{anyhow, Result};
use merel_common::dns::Resolver;
use merel_common::types::Validation;
use tracing::{debug, warn};

/// SPF verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfStatus {
    /// The sending IP is authorized
    Pass,
    /// The sending IP is explicitly not authorized
    Fail,
    /// The sending IP is probably not authorized (soft fail)
    SoftFail,
    /// The domain owner has no opinion
    Neutral,
    /// No SPF record found
    None,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid SPF record)
    PermError,
}

impl SpfStatus {
    /// Convert to header value for Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            SpfStatus::Pass => "pass",
            SpfStatus::Fail => "fail",
            SpfStatus::SoftFail => "softfail",
            SpfStatus::Neutral => "neutral",
            SpfStatus::None => "none",
            SpfStatus::TempError => "temperror",
            SpfStatus::PermError => "permerror",
        }
    }

    /// The MAIL FROM validation value stored with a delivered message.
    pub fn to_validation(self) -> Validation {
        match self {
            SpfStatus::Pass => Validation::Pass,
            SpfStatus::Fail => Validation::Fail,
            SpfStatus::SoftFail => Validation::Softfail,
            SpfStatus::Neutral => Validation::Neutral,
            SpfStatus::None => Validation::None,
            SpfStatus::TempError => Validation::Temperror,
            SpfStatus::PermError => Validation::Permerror,
        }
    }
}

/// SPF mechanism types
#[derive(Debug, Clone)]
enum SpfMechanism {
    All,
    Include(String),
    A(Option<String>),
    Mx(Option<String>),
    Ip4(ipnet::Ipv4Net),
    Ip6(ipnet::Ipv6Net),
    Ptr(Option<String>),
    Exists(String),
}

/// SPF qualifier (prefix)
#[derive(Debug, Clone, Copy, PartialEq)]
enum SpfQualifier {
    Pass,     // + (default)
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl SpfQualifier {
    fn to_status(self) -> SpfStatus {
        match self {
            SpfQualifier::Pass => SpfStatus::Pass,
            SpfQualifier::Fail => SpfStatus::Fail,
            SpfQualifier::SoftFail => SpfStatus::SoftFail,
            SpfQualifier::Neutral => SpfStatus::Neutral,
        }
    }
}

/// Parsed SPF directive (qualifier + mechanism)
#[derive(Debug, Clone)]
struct SpfDirective {
    qualifier: SpfQualifier,
    mechanism: SpfMechanism,
}

/// SPF verifier
pub struct SpfVerifier<'a> {
    resolver: &'a dyn Resolver,
    max_dns_lookups: usize,
}

impl<'a> SpfVerifier<'a> {
    pub fn new(resolver: &'a dyn Resolver) -> Self {
        Self {
            resolver,
            max_dns_lookups: 10, // RFC 7208 limit
        }
    }

    /// Verify SPF for a given sender and connecting IP
    pub async fn verify(&self, mail_from: &str, client_ip: IpAddr) -> SpfStatus {
        let domain = match extract_domain(mail_from) {
            Some(d) => d,
            None => {
                debug!("Could not extract domain from MAIL FROM: {}", mail_from);
                return SpfStatus::None;
            }
        };

        debug!("Checking SPF for domain {} from IP {}", domain, client_ip);

        match self.check_spf(&domain, client_ip, 0).await {
            Ok(result) => result,
            Err(e) => {
                warn!("SPF check error for {}: {}", domain, e);
                SpfStatus::TempError
            }
        }
    }

    /// Recursive SPF check with depth tracking
    fn check_spf<'b>(
        &'b self,
        domain: &'b str,
        client_ip: IpAddr,
        depth: usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<SpfStatus>> + Send + 'b>> {
        Box::pin(async move {
            if depth >= self.max_dns_lookups {
                return Ok(SpfStatus::PermError);
            }

            let spf_record = match self.get_spf_record(domain).await {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(SpfStatus::None),
                Err(e) => {
                    warn!("DNS lookup failed for {}: {}", domain, e);
                    return Ok(SpfStatus::TempError);
                }
            };

            debug!("Found SPF record for {}: {}", domain, spf_record);

            let directives = match parse_spf_record(&spf_record) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Failed to parse SPF record for {}: {}", domain, e);
                    return Ok(SpfStatus::PermError);
                }
            };

            for directive in directives {
                match self
                    .evaluate_directive(&directive, domain, client_ip, depth)
                    .await?
                {
                    Some(result) => return Ok(result),
                    None => continue,
                }
            }

            // Default result if no mechanism matches
            Ok(SpfStatus::Neutral)
        })
    }

    /// Get SPF TXT record for a domain
    async fn get_spf_record(&self, domain: &str) -> Result<Option<String>> {
        let txts = match self.resolver.lookup_txt(domain).await {
            Ok(txts) => txts,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(anyhow!("txt lookup: {}", e)),
        };

        for txt in txts {
            if txt.starts_with("v=spf1 ") || txt == "v=spf1" {
                return Ok(Some(txt));
            }
        }

        Ok(None)
    }

    /// Evaluate a single SPF directive
    fn evaluate_directive<'b>(
        &'b self,
        directive: &'b SpfDirective,
        domain: &'b str,
        client_ip: IpAddr,
        depth: usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<SpfStatus>>> + Send + 'b>>
    {
        Box::pin(async move {
            let matches = match &directive.mechanism {
                SpfMechanism::All => true,

                SpfMechanism::Ip4(network) => {
                    if let IpAddr::V4(ip) = client_ip {
                        network.contains(&ip)
                    } else {
                        false
                    }
                }

                SpfMechanism::Ip6(network) => {
                    if let IpAddr::V6(ip) = client_ip {
                        network.contains(&ip)
                    } else {
                        false
                    }
                }

                SpfMechanism::A(target) => {
                    let target_domain = target.as_deref().unwrap_or(domain);
                    self.check_a_record(target_domain, client_ip).await?
                }

                SpfMechanism::Mx(target) => {
                    let target_domain = target.as_deref().unwrap_or(domain);
                    self.check_mx_record(target_domain, client_ip).await?
                }

                SpfMechanism::Include(included_domain) => {
                    let result = self.check_spf(included_domain, client_ip, depth + 1).await?;
                    result == SpfStatus::Pass
                }

                SpfMechanism::Ptr(_) => {
                    // PTR mechanism is deprecated and computationally expensive
                    // We treat it as a non-match for security reasons
                    warn!("PTR mechanism used but not evaluated (deprecated)");
                    false
                }

                SpfMechanism::Exists(macro_domain) => self.check_exists(macro_domain).await?,
            };

            if matches {
                Ok(Some(directive.qualifier.to_status()))
            } else {
                Ok(None)
            }
        })
    }

    /// Check if client IP matches any A/AAAA record for domain
    async fn check_a_record(&self, domain: &str, client_ip: IpAddr) -> Result<bool> {
        match client_ip {
            IpAddr::V4(ip) => {
                if let Ok(records) = self.resolver.lookup_ipv4(domain).await {
                    return Ok(records.contains(&ip));
                }
            }
            IpAddr::V6(ip) => {
                if let Ok(records) = self.resolver.lookup_ipv6(domain).await {
                    return Ok(records.contains(&ip));
                }
            }
        }
        Ok(false)
    }

    /// Check if client IP matches any MX host's A/AAAA record
    async fn check_mx_record(&self, domain: &str, client_ip: IpAddr) -> Result<bool> {
        if let Ok(records) = self.resolver.lookup_mx(domain).await {
            for mx in records {
                if self.check_a_record(&mx.host, client_ip).await? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Check if A record exists for domain (exists mechanism)
    async fn check_exists(&self, domain: &str) -> Result<bool> {
        Ok(self.resolver.lookup_ipv4(domain).await.is_ok())
    }
}

/// Extract domain from email address
fn extract_domain(email: &str) -> Option<String> {
    // Handle <user@domain> format
    let email = email.trim_start_matches('<').trim_end_matches('>');

    if let Some(at_pos) = email.rfind('@') {
        let domain = &email[at_pos + 1..];
        if !domain.is_empty() {
            return Some(domain.to_lowercase());
        }
    }

    None
}

/// Parse SPF record into directives
fn parse_spf_record(record: &str) -> Result<Vec<SpfDirective>> {
    let mut directives = Vec::new();

    let terms: &str = record
        .strip_prefix("v=spf1")
        .ok_or_else(|| anyhow!("Invalid SPF record: missing v=spf1"))?
        .trim();

    for term in terms.split_whitespace() {
        // Skip modifiers (exp, etc.); redirect is treated as include.
        if term.contains('=') {
            if let Some(domain) = term.strip_prefix("redirect=") {
                directives.push(SpfDirective {
                    qualifier: SpfQualifier::Pass,
                    mechanism: SpfMechanism::Include(domain.to_string()),
                });
            }
            continue;
        }

        let (qualifier, mechanism_str) = match term.chars().next() {
            Some('+') => (SpfQualifier::Pass, &term[1..]),
            Some('-') => (SpfQualifier::Fail, &term[1..]),
            Some('~') => (SpfQualifier::SoftFail, &term[1..]),
            Some('?') => (SpfQualifier::Neutral, &term[1..]),
            _ => (SpfQualifier::Pass, term),
        };

        let mechanism = parse_mechanism(mechanism_str)?;

        directives.push(SpfDirective {
            qualifier,
            mechanism,
        });
    }

    Ok(directives)
}

/// Parse a single SPF mechanism
fn parse_mechanism(s: &str) -> Result<SpfMechanism> {
    if s == "all" {
        return Ok(SpfMechanism::All);
    }

    if s == "a" {
        return Ok(SpfMechanism::A(None));
    }

    if let Some(domain) = s.strip_prefix("a:") {
        return Ok(SpfMechanism::A(Some(domain.to_string())));
    }

    if s == "mx" {
        return Ok(SpfMechanism::Mx(None));
    }

    if let Some(domain) = s.strip_prefix("mx:") {
        return Ok(SpfMechanism::Mx(Some(domain.to_string())));
    }

    if let Some(network) = s.strip_prefix("ip4:") {
        let net = if network.contains('/') {
            network.parse()?
        } else {
            format!("{}/32", network).parse()?
        };
        return Ok(SpfMechanism::Ip4(net));
    }

    if let Some(network) = s.strip_prefix("ip6:") {
        let net = if network.contains('/') {
            network.parse()?
        } else {
            format!("{}/128", network).parse()?
        };
        return Ok(SpfMechanism::Ip6(net));
    }

    if let Some(domain) = s.strip_prefix("include:") {
        return Ok(SpfMechanism::Include(domain.to_string()));
    }

    if s == "ptr" {
        return Ok(SpfMechanism::Ptr(None));
    }

    if let Some(domain) = s.strip_prefix("ptr:") {
        return Ok(SpfMechanism::Ptr(Some(domain.to_string())));
    }

    if let Some(domain) = s.strip_prefix("exists:") {
        return Ok(SpfMechanism::Exists(domain.to_string()));
    }

    Err(anyhow!("Unknown SPF mechanism: {}", s))
}
