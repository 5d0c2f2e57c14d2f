//! DKIM (DomainKeys Identified Mail) verification
//!
//! Implements the verification side of RFC 6376: signature header parsing,
//! simple/relaxed canonicalization, key record lookup and RSA-SHA256
//! signature checking. Every signature on a message yields an outcome; the
//! inbound analysis cares about passing signatures, their domains, whether
//! the body hash was length-limited (l=) and the key record's service tags.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use merel_common::dns::Resolver;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature as RsaSignature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// DKIM verification result for one signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkimStatus {
    /// Signature is valid
    Pass,
    /// Signature verification failed
    Fail,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid signature or key record)
    PermError,
}

impl DkimStatus {
    /// Convert to header value for Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DkimStatus::Pass => "pass",
            DkimStatus::Fail => "fail",
            DkimStatus::TempError => "temperror",
            DkimStatus::PermError => "permerror",
        }
    }
}

/// DKIM canonicalization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Canonicalization {
    /// Simple canonicalization
    #[default]
    Simple,
    /// Relaxed canonicalization
    Relaxed,
}

/// A parsed DKIM-Signature header
#[derive(Debug, Clone)]
pub struct DkimSignature {
    /// Signing domain (d= tag)
    pub domain: String,
    /// Selector (s= tag)
    pub selector: String,
    /// Signing algorithm (a= tag)
    pub algorithm: String,
    pub header_canon: Canonicalization,
    pub body_canon: Canonicalization,
    /// Headers covered by the signature (h= tag)
    pub signed_headers: Vec<String>,
    /// Expected body hash (bh= tag)
    pub body_hash: Vec<u8>,
    /// The signature itself (b= tag)
    pub signature: Vec<u8>,
    /// Body length limit (l= tag); signatures with l= cover only part of
    /// the body and are distrusted by report ingestion.
    pub body_length: Option<usize>,
}

/// A fetched DKIM key record (the TXT at `<selector>._domainkey.<domain>`)
#[derive(Debug, Clone, Default)]
pub struct DkimRecord {
    /// DER-encoded public key (p= tag)
    pub public_key: Vec<u8>,
    /// Acceptable service types (s= tag); empty means unrestricted.
    pub services: Vec<String>,
}

impl DkimRecord {
    /// Whether the key may be used for the given service type.
    pub fn service_allowed(&self, service: &str) -> bool {
        self.services.is_empty()
            || self.services.iter().any(|s| s == "*" || s == service)
    }
}

/// Outcome of verifying one signature on a message
#[derive(Debug, Clone)]
pub struct DkimOutcome {
    pub status: DkimStatus,
    pub signature: Option<DkimSignature>,
    pub record: Option<DkimRecord>,
}

impl DkimOutcome {
    /// A passing signature from exactly this domain.
    pub fn is_pass_for(&self, domain: &str) -> bool {
        self.status == DkimStatus::Pass
            && self
                .signature
                .as_ref()
                .is_some_and(|s| s.domain == domain.to_lowercase())
    }
}

/// DKIM verifier for incoming mail
pub struct DkimVerifier<'a> {
    resolver: &'a dyn Resolver,
}

impl<'a> DkimVerifier<'a> {
    pub fn new(resolver: &'a dyn Resolver) -> Self {
        Self { resolver }
    }

    /// Verify every DKIM-Signature header on a message.
    pub async fn verify(&self, message: &[u8]) -> Vec<DkimOutcome> {
        let (headers, body) = match split_message(message) {
            Ok(v) => v,
            Err(e) => {
                debug!("unparseable message: {}", e);
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            if header.name != "dkim-signature" {
                continue;
            }
            let sig = match parse_signature(&header.value) {
                Ok(sig) => sig,
                Err(e) => {
                    debug!("invalid dkim-signature header: {}", e);
                    outcomes.push(DkimOutcome {
                        status: DkimStatus::PermError,
                        signature: None,
                        record: None,
                    });
                    continue;
                }
            };
            let outcome = self.verify_signature(&headers, idx, &body, sig).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn verify_signature(
        &self,
        headers: &[Header],
        sig_index: usize,
        body: &str,
        sig: DkimSignature,
    ) -> DkimOutcome {
        if sig.algorithm != "rsa-sha256" {
            return DkimOutcome {
                status: DkimStatus::PermError,
                signature: Some(sig),
                record: None,
            };
        }

        // Body hash first, it needs no DNS.
        let canon_body = canonicalize_body(body, sig.body_canon);
        let hashed = match sig.body_length {
            Some(l) if l < canon_body.len() => &canon_body[..l],
            _ => &canon_body[..],
        };
        if Sha256::digest(hashed).as_slice() != sig.body_hash.as_slice() {
            debug!(domain = %sig.domain, "dkim body hash mismatch");
            return DkimOutcome {
                status: DkimStatus::Fail,
                signature: Some(sig),
                record: None,
            };
        }

        let name = format!("{}._domainkey.{}", sig.selector, sig.domain);
        let record = match self.fetch_record(&name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return DkimOutcome {
                    status: DkimStatus::PermError,
                    signature: Some(sig),
                    record: None,
                }
            }
            Err(e) => {
                warn!(name, "dkim key lookup: {}", e);
                return DkimOutcome {
                    status: DkimStatus::TempError,
                    signature: Some(sig),
                    record: None,
                };
            }
        };

        let input = header_hash_input(headers, sig_index, &sig);
        let status = match verify_rsa(&record.public_key, input.as_bytes(), &sig.signature) {
            Ok(true) => DkimStatus::Pass,
            Ok(false) => DkimStatus::Fail,
            Err(e) => {
                debug!(domain = %sig.domain, "dkim key unusable: {}", e);
                DkimStatus::PermError
            }
        };
        DkimOutcome {
            status,
            signature: Some(sig),
            record: Some(record),
        }
    }

    async fn fetch_record(&self, name: &str) -> Result<Option<DkimRecord>> {
        let txts = match self.resolver.lookup_txt(name).await {
            Ok(txts) => txts,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(anyhow!("txt lookup: {}", e)),
        };
        for txt in txts {
            if let Some(record) = parse_record(&txt)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

fn verify_rsa(key_der: &[u8], data: &[u8], signature: &[u8]) -> Result<bool> {
    // Keys in the wild are SubjectPublicKeyInfo; some are bare PKCS#1.
    let key = RsaPublicKey::from_public_key_der(key_der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(key_der))
        .map_err(|e| anyhow!("parsing public key: {}", e))?;
    let verifying_key = VerifyingKey::<Sha256>::new(key);
    let signature =
        RsaSignature::try_from(signature).map_err(|e| anyhow!("parsing signature: {}", e))?;
    Ok(verifying_key.verify(data, &signature).is_ok())
}

/// A message header with folded lines joined by their original CRLFs.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    /// Lowercased name.
    pub name: String,
    /// Raw value, excluding the final CRLF.
    pub value: String,
    /// The raw "Name: value" text, excluding the final CRLF.
    pub raw: String,
}

/// Split a message into headers and body.
pub(crate) fn split_message(message: &[u8]) -> Result<(Vec<Header>, String)> {
    let text = String::from_utf8_lossy(message);
    let (head, body) = match text.split_once("\r\n\r\n") {
        Some(v) => v,
        None => text
            .split_once("\n\n")
            .ok_or_else(|| anyhow!("no header/body separator"))?,
    };

    let mut headers: Vec<Header> = Vec::new();
    for line in head.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous header.
            if let Some(last) = headers.last_mut() {
                last.value.push_str("\r\n");
                last.value.push_str(line);
                last.raw.push_str("\r\n");
                last.raw.push_str(line);
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line"))?;
        headers.push(Header {
            name: name.trim().to_lowercase(),
            value: value.trim_start().to_string(),
            raw: line.to_string(),
        });
    }
    Ok((headers, body.to_string()))
}

/// Canonicalize the message body
pub(crate) fn canonicalize_body(body: &str, canon: Canonicalization) -> Vec<u8> {
    match canon {
        Canonicalization::Simple => {
            let normalized = body.replace("\r\n", "\n");
            let mut result = normalized.replace('\n', "\r\n");
            while result.ends_with("\r\n\r\n") {
                result.truncate(result.len() - 2);
            }
            if !result.ends_with("\r\n") {
                result.push_str("\r\n");
            }
            result.into_bytes()
        }
        Canonicalization::Relaxed => {
            let mut lines: Vec<String> = body
                .lines()
                .map(|line| {
                    let mut result = String::new();
                    let mut last_was_space = false;
                    for c in line.chars() {
                        if c.is_whitespace() {
                            if !last_was_space {
                                result.push(' ');
                                last_was_space = true;
                            }
                        } else {
                            result.push(c);
                            last_was_space = false;
                        }
                    }
                    result.trim_end().to_string()
                })
                .collect();

            while lines.last().is_some_and(|l| l.is_empty()) {
                lines.pop();
            }

            let mut result = lines.join("\r\n");
            if !result.is_empty() {
                result.push_str("\r\n");
            }
            result.into_bytes()
        }
    }
}

/// Canonicalize a single header
pub(crate) fn canonicalize_header(header: &Header, canon: Canonicalization) -> String {
    match canon {
        Canonicalization::Simple => format!("{}\r\n", header.raw),
        Canonicalization::Relaxed => {
            let value = header.value.replace("\r\n", " ").replace('\t', " ");
            let value: String = value.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("{}:{}\r\n", header.name, value)
        }
    }
}

/// The exact bytes the signature covers: the signed headers bottom-up per
/// name, followed by the DKIM-Signature header itself with the b= value
/// removed and no trailing CRLF.
pub(crate) fn header_hash_input(headers: &[Header], sig_index: usize, sig: &DkimSignature) -> String {
    let mut used = vec![false; headers.len()];
    used[sig_index] = true;

    let mut result = String::new();
    for name in &sig.signed_headers {
        let lower = name.to_lowercase();
        // The last not-yet-used occurrence of this name.
        if let Some(idx) = headers
            .iter()
            .enumerate()
            .rev()
            .find(|(i, h)| !used[*i] && h.name == lower)
            .map(|(i, _)| i)
        {
            used[idx] = true;
            result.push_str(&canonicalize_header(&headers[idx], sig.header_canon));
        }
    }

    let stripped = Header {
        name: headers[sig_index].name.clone(),
        value: strip_b_value(&headers[sig_index].value),
        raw: strip_b_value(&headers[sig_index].raw),
    };
    let canon = canonicalize_header(&stripped, sig.header_canon);
    result.push_str(canon.trim_end_matches("\r\n"));
    result
}

/// Remove the value of the b= tag, keeping the tag itself.
pub(crate) fn strip_b_value(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("b=") {
            Some(pos) => {
                // Tag boundary: start of string or preceded by ';' or whitespace.
                let boundary = pos == 0
                    || rest[..pos]
                        .chars()
                        .next_back()
                        .is_some_and(|c| c == ';' || c.is_whitespace());
                result.push_str(&rest[..pos + 2]);
                rest = &rest[pos + 2..];
                if boundary {
                    match rest.find(';') {
                        Some(end) => rest = &rest[end..],
                        None => rest = "",
                    }
                }
            }
            None => {
                result.push_str(rest);
                return result;
            }
        }
    }
}

/// Parse a DKIM-Signature header value into a signature struct
pub(crate) fn parse_signature(value: &str) -> Result<DkimSignature> {
    let tags = parse_tags(value);

    if tags.get("v").map(String::as_str) != Some("1") {
        return Err(anyhow!("unsupported dkim version"));
    }

    let get = |name: &str| {
        tags.get(name)
            .cloned()
            .ok_or_else(|| anyhow!("missing {}= tag", name))
    };

    let (header_canon, body_canon) = match tags.get("c").map(String::as_str) {
        None => (Canonicalization::Simple, Canonicalization::Simple),
        Some(c) => {
            let (h, b) = c.split_once('/').unwrap_or((c, "simple"));
            (parse_canon(h)?, parse_canon(b)?)
        }
    };

    let strip_ws = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();

    Ok(DkimSignature {
        domain: get("d")?.to_lowercase(),
        selector: get("s")?.to_lowercase(),
        algorithm: get("a")?.to_lowercase(),
        header_canon,
        body_canon,
        signed_headers: get("h")?
            .split(':')
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect(),
        body_hash: BASE64
            .decode(strip_ws(&get("bh")?))
            .map_err(|e| anyhow!("bh= not base64: {}", e))?,
        signature: BASE64
            .decode(strip_ws(&get("b")?))
            .map_err(|e| anyhow!("b= not base64: {}", e))?,
        body_length: tags
            .get("l")
            .map(|l| l.parse().map_err(|_| anyhow!("invalid l= tag")))
            .transpose()?,
    })
}

/// Parse a DKIM key record TXT value. Returns None when the TXT is not a
/// DKIM record at all.
pub(crate) fn parse_record(txt: &str) -> Result<Option<DkimRecord>> {
    let tags = parse_tags(txt);
    if let Some(v) = tags.get("v") {
        if v != "DKIM1" {
            return Ok(None);
        }
    } else if !tags.contains_key("p") {
        return Ok(None);
    }

    if let Some(k) = tags.get("k") {
        if k != "rsa" {
            return Err(anyhow!("unsupported key type {}", k));
        }
    }

    let p = tags.get("p").ok_or_else(|| anyhow!("missing p= tag"))?;
    if p.is_empty() {
        return Err(anyhow!("revoked key"));
    }
    let key: String = p.chars().filter(|c| !c.is_whitespace()).collect();

    Ok(Some(DkimRecord {
        public_key: BASE64
            .decode(key)
            .map_err(|e| anyhow!("p= not base64: {}", e))?,
        services: tags
            .get("s")
            .map(|s| s.split(':').map(|v| v.trim().to_string()).collect())
            .unwrap_or_default(),
    }))
}

fn parse_canon(s: &str) -> Result<Canonicalization> {
    match s {
        "simple" => Ok(Canonicalization::Simple),
        "relaxed" => Ok(Canonicalization::Relaxed),
        _ => Err(anyhow!("unknown canonicalization {}", s)),
    }
}

/// Parse a tag=value list as used by signature headers and key records.
fn parse_tags(text: &str) -> std::collections::HashMap<String, String> {
    let mut tags = std::collections::HashMap::new();
    for part in text.split(';') {
        if let Some((name, value)) = part.split_once('=') {
            tags.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    tags
}
