//! DMARC (Domain-based Message Authentication, Reporting, and Conformance)
//!
//! Implements the evaluation side of RFC 7489: record lookup with
//! organizational-domain fallback, SPF/DKIM alignment, and the resulting
//! accept/reject signal.

use anyhow::{anyhow, Result};
use merel_common::dns::Resolver;
use merel_common::types::organizational_domain;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::dkim::{DkimOutcome, DkimStatus};
use super::spf::SpfStatus;

/// DMARC policy action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmarcPolicy {
    /// No policy (monitor mode)
    #[default]
    None,
    /// Quarantine messages (move to spam)
    Quarantine,
    /// Reject messages
    Reject,
}

/// DMARC verification status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmarcStatus {
    /// No DMARC record found
    #[default]
    None,
    /// Aligned SPF or DKIM pass
    Pass,
    /// Record present, no aligned pass
    Fail,
    /// Temporary error
    TempError,
    /// Permanent error (invalid record)
    PermError,
}

impl DmarcStatus {
    /// Convert to header value for Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DmarcStatus::None => "none",
            DmarcStatus::Pass => "pass",
            DmarcStatus::Fail => "fail",
            DmarcStatus::TempError => "temperror",
            DmarcStatus::PermError => "permerror",
        }
    }
}

/// The evaluation the inbound analysis consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmarcEvaluation {
    /// Whether the From domain publishes a DMARC record.
    pub in_use: bool,
    pub status: DmarcStatus,
    /// Evaluation failed and the published policy asks for rejection.
    pub reject: bool,
}

/// Alignment mode for DKIM/SPF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    /// Strict: domains must match exactly
    Strict,
    /// Relaxed: organizational domains must match
    #[default]
    Relaxed,
}

/// Parsed DMARC record
#[derive(Debug, Clone)]
pub struct DmarcRecord {
    /// Policy for messages from the domain (p=)
    pub policy: DmarcPolicy,
    /// Policy for subdomains (sp=)
    pub subdomain_policy: Option<DmarcPolicy>,
    /// Percentage of messages to apply policy (pct=)
    pub percentage: u8,
    /// DKIM alignment mode (adkim=)
    pub dkim_alignment: AlignmentMode,
    /// SPF alignment mode (aspf=)
    pub spf_alignment: AlignmentMode,
    /// Aggregate report URI (rua=)
    pub aggregate_report_uri: Option<String>,
}

impl Default for DmarcRecord {
    fn default() -> Self {
        Self {
            policy: DmarcPolicy::None,
            subdomain_policy: None,
            percentage: 100,
            dkim_alignment: AlignmentMode::Relaxed,
            spf_alignment: AlignmentMode::Relaxed,
            aggregate_report_uri: None,
        }
    }
}

/// DMARC verifier
pub struct DmarcVerifier<'a> {
    resolver: &'a dyn Resolver,
}

impl<'a> DmarcVerifier<'a> {
    pub fn new(resolver: &'a dyn Resolver) -> Self {
        Self { resolver }
    }

    /// Evaluate DMARC for a message.
    ///
    /// `from_domain` is the From-header domain; `spf_status` and
    /// `mail_from_domain` describe the SPF evaluation of the envelope
    /// sender; `dkim_outcomes` are the verified signatures.
    pub async fn evaluate(
        &self,
        from_domain: &str,
        spf_status: SpfStatus,
        mail_from_domain: Option<&str>,
        dkim_outcomes: &[DkimOutcome],
    ) -> DmarcEvaluation {
        let from_domain = from_domain.to_lowercase();
        let (record, from_subdomain) = match self.fetch_record(&from_domain).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                debug!("No DMARC record found for {}", from_domain);
                return DmarcEvaluation::default();
            }
            Err(e) => {
                warn!("Failed to fetch DMARC record for {}: {}", from_domain, e);
                return DmarcEvaluation {
                    in_use: false,
                    status: DmarcStatus::TempError,
                    reject: false,
                };
            }
        };

        let spf_aligned = spf_status == SpfStatus::Pass
            && mail_from_domain
                .is_some_and(|d| aligned(&from_domain, d, record.spf_alignment));

        let dkim_aligned = dkim_outcomes.iter().any(|o| {
            o.status == DkimStatus::Pass
                && o.signature
                    .as_ref()
                    .is_some_and(|s| aligned(&from_domain, &s.domain, record.dkim_alignment))
        });

        if spf_aligned || dkim_aligned {
            debug!(
                "DMARC pass for {}: SPF aligned={}, DKIM aligned={}",
                from_domain, spf_aligned, dkim_aligned
            );
            return DmarcEvaluation {
                in_use: true,
                status: DmarcStatus::Pass,
                reject: false,
            };
        }

        // A subdomain record applies sp= when present.
        let policy = if from_subdomain {
            record.subdomain_policy.unwrap_or(record.policy)
        } else {
            record.policy
        };
        debug!(
            "DMARC fail for {}: policy={:?}, pct={}",
            from_domain, policy, record.percentage
        );
        DmarcEvaluation {
            in_use: true,
            status: DmarcStatus::Fail,
            reject: policy == DmarcPolicy::Reject,
        }
    }

    /// Fetch the DMARC record, falling back to the organizational domain.
    /// The bool is whether the fallback was used.
    async fn fetch_record(&self, domain: &str) -> Result<Option<(DmarcRecord, bool)>> {
        if let Some(record) = self.fetch_record_at(domain).await? {
            return Ok(Some((record, false)));
        }
        let org = organizational_domain(domain);
        if org != domain {
            if let Some(record) = self.fetch_record_at(&org).await? {
                return Ok(Some((record, true)));
            }
        }
        Ok(None)
    }

    async fn fetch_record_at(&self, domain: &str) -> Result<Option<DmarcRecord>> {
        let name = format!("_dmarc.{}", domain);
        let txts = match self.resolver.lookup_txt(&name).await {
            Ok(txts) => txts,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(anyhow!("txt lookup: {}", e)),
        };
        for txt in txts {
            if txt.starts_with("v=DMARC1") {
                return Ok(Some(parse_dmarc_record(&txt)?));
            }
        }
        Ok(None)
    }
}

/// Check if two domains are aligned
fn aligned(from_domain: &str, auth_domain: &str, mode: AlignmentMode) -> bool {
    let from_domain = from_domain.to_lowercase();
    let auth_domain = auth_domain.to_lowercase();

    match mode {
        AlignmentMode::Strict => from_domain == auth_domain,
        AlignmentMode::Relaxed => {
            organizational_domain(&from_domain) == organizational_domain(&auth_domain)
        }
    }
}

/// Parse DMARC record from TXT value
pub fn parse_dmarc_record(txt: &str) -> Result<DmarcRecord> {
    let mut record = DmarcRecord::default();

    let tags = parse_tags(txt);

    if tags.get("v").map(String::as_str) != Some("DMARC1") {
        return Err(anyhow!("Invalid DMARC version"));
    }

    if let Some(p) = tags.get("p") {
        record.policy = parse_policy(p)?;
    } else {
        return Err(anyhow!("Missing required p= tag"));
    }

    if let Some(sp) = tags.get("sp") {
        record.subdomain_policy = Some(parse_policy(sp)?);
    }

    if let Some(pct) = tags.get("pct") {
        record.percentage = pct
            .parse()
            .map_err(|_| anyhow!("Invalid pct value: {}", pct))?;
    }

    if let Some(adkim) = tags.get("adkim") {
        record.dkim_alignment = parse_alignment(adkim)?;
    }

    if let Some(aspf) = tags.get("aspf") {
        record.spf_alignment = parse_alignment(aspf)?;
    }

    if let Some(rua) = tags.get("rua") {
        record.aggregate_report_uri = Some(rua.clone());
    }

    Ok(record)
}

fn parse_tags(txt: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for part in txt.split(';') {
        let part = part.trim();
        if let Some(eq_pos) = part.find('=') {
            let name = part[..eq_pos].trim().to_lowercase();
            let value = part[eq_pos + 1..].trim().to_string();
            tags.insert(name, value);
        }
    }
    tags
}

fn parse_policy(s: &str) -> Result<DmarcPolicy> {
    match s.to_lowercase().as_str() {
        "none" => Ok(DmarcPolicy::None),
        "quarantine" => Ok(DmarcPolicy::Quarantine),
        "reject" => Ok(DmarcPolicy::Reject),
        _ => Err(anyhow!("Invalid policy: {}", s)),
    }
}

fn parse_alignment(s: &str) -> Result<AlignmentMode> {
    match s.to_lowercase().as_str() {
        "r" => Ok(AlignmentMode::Relaxed),
        "s" => Ok(AlignmentMode::Strict),
        _ => Err(anyhow!("Invalid alignment mode: {}", s)),
    }
}
