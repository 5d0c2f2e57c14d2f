//! MTA-STS (SMTP MTA Strict Transport Security, RFC 8461).
//!
//! A domain can require STARTTLS for mail delivered to it: a TXT record at
//! `_mta-sts.<domain>` names a policy version, and
//! `https://mta-sts.<domain>/.well-known/mta-sts.txt` serves the policy
//! with its mode and allowed MX hosts. Without this, STARTTLS downgrade is
//! a silent fallback to plain text.

use std::time::Duration;

use merel_common::dns::Resolver;
use thiserror::Error;
use tracing::debug;

/// An extension key/value pair in an MTA-STS DNS record or policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key: String,
    pub value: String,
}

/// An MTA-STS DNS record, e.g. `v=STSv1; id=20160831085700Z`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// "STSv1", for "v=". Required.
    pub version: String,
    /// Record version, for "id=". Required.
    pub id: String,
    pub extensions: Vec<Pair>,
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v={}; id={}", self.version, self.id)?;
        for p in &self.extensions {
            write!(f, "; {}={}", p.key, p.value)?;
        }
        Ok(())
    }
}

/// How the policy should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Deliveries must fail if a verified TLS connection cannot be made.
    Enforce,
    /// Failures are allowed but should be reported, e.g. with TLS-RPT.
    Testing,
    /// MTA-STS is not or no longer implemented.
    None,
}

impl Mode {
    fn parse(s: &str) -> Result<Mode, Error> {
        match s {
            "enforce" => Ok(Mode::Enforce),
            "testing" => Ok(Mode::Testing),
            "none" => Ok(Mode::None),
            _ => Err(Error::PolicySyntax(format!("unknown mode {:?}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Enforce => "enforce",
            Mode::Testing => "testing",
            Mode::None => "none",
        }
    }
}

/// An allowlisted MX host name or pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    /// A "*." wildcard matches exactly one leading label.
    pub wildcard: bool,
    pub domain: String,
}

/// A policy as served at the well-known URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub version: String,
    pub mode: Mode,
    pub mx: Vec<MxHost>,
    /// How long this policy may be cached, in seconds.
    pub max_age_seconds: u64,
    pub extensions: Vec<Pair>,
}

impl Policy {
    /// Whether a hostname matches the policy's MX list.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        for mx in &self.mx {
            if mx.wildcard {
                if let Some((_, parent)) = host.split_once('.') {
                    if parent == mx.domain {
                        return true;
                    }
                }
            } else if host == mx.domain {
                return true;
            }
        }
        false
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "version: {}", self.version)?;
        writeln!(f, "mode: {}", self.mode.as_str())?;
        writeln!(f, "max_age: {}", self.max_age_seconds)?;
        for mx in &self.mx {
            if mx.wildcard {
                writeln!(f, "mx: *.{}", mx.domain)?;
            } else {
                writeln!(f, "mx: {}", mx.domain)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Domain does not implement MTA-STS. A cached non-expired policy, if
    /// any, should still be used.
    #[error("no mta-sts dns txt record")]
    NoRecord,
    /// Should be treated as not implementing MTA-STS, unless a cached
    /// non-expired policy is available.
    #[error("multiple mta-sts records")]
    MultipleRecords,
    #[error("dns lookup: {0}")]
    Dns(String),
    #[error("record syntax: {0}")]
    RecordSyntax(String),
    /// The policy URL does not exist.
    #[error("no policy served")]
    NoPolicy,
    #[error("cannot fetch policy: {0}")]
    PolicyFetch(String),
    #[error("policy syntax: {0}")]
    PolicySyntax(String),
}

/// Policies longer than this are a syntax error.
const MAX_POLICY_SIZE: usize = 64 * 1024;
/// Fetch deadline for the policy.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
/// CNAME chains longer than this are rejected; chains of 10 have been
/// seen on the Internet.
const MAX_CNAMES: usize = 16;

/// Look up the MTA-STS TXT record at `_mta-sts.<domain>`, following CNAME
/// records, and return the parsed record plus any CNAMEs followed.
pub async fn lookup_record(
    resolver: &dyn Resolver,
    domain: &str,
) -> Result<(Record, Vec<String>), Error> {
    let mut cnames: Vec<String> = Vec::new();
    let mut name = format!("_mta-sts.{}", domain.to_lowercase());

    let txts = loop {
        match resolver.lookup_txt(&name).await {
            Ok(txts) => break txts,
            Err(e) if e.is_not_found() => {
                if cnames.len() >= MAX_CNAMES {
                    return Err(Error::Dns("too many cnames".to_string()));
                }
                match resolver.lookup_cname(&name).await {
                    Ok(Some(cname)) => {
                        cnames.push(cname.clone());
                        name = cname;
                    }
                    Ok(None) => return Err(Error::NoRecord),
                    Err(e) if e.is_not_found() => return Err(Error::NoRecord),
                    Err(e) => return Err(Error::Dns(e.to_string())),
                }
            }
            Err(e) => return Err(Error::Dns(e.to_string())),
        }
    };

    let mut record = None;
    for txt in txts {
        let (r, is_sts) = parse_record(&txt)?;
        if !is_sts {
            continue;
        }
        if record.is_some() {
            return Err(Error::MultipleRecords);
        }
        record = Some(r);
    }
    match record {
        Some(r) => Ok((r, cnames)),
        None => Err(Error::NoRecord),
    }
}

/// Parse a TXT value as an MTA-STS record. The bool is false when the TXT
/// is not an MTA-STS record at all.
pub fn parse_record(txt: &str) -> Result<(Record, bool), Error> {
    if txt != "v=STSv1" && !txt.starts_with("v=STSv1;") {
        return Ok((
            Record {
                version: String::new(),
                id: String::new(),
                extensions: Vec::new(),
            },
            false,
        ));
    }

    let mut record = Record {
        version: String::new(),
        id: String::new(),
        extensions: Vec::new(),
    };
    for part in txt.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| Error::RecordSyntax(format!("bad pair {:?}", part)))?;
        match key.trim() {
            "v" => record.version = value.trim().to_string(),
            "id" => record.id = value.trim().to_string(),
            key => record.extensions.push(Pair {
                key: key.to_string(),
                value: value.trim().to_string(),
            }),
        }
    }
    if record.version != "STSv1" || record.id.is_empty() {
        return Err(Error::RecordSyntax("missing v= or id=".to_string()));
    }
    Ok((record, true))
}

/// Fetch a domain's policy from the well-known HTTPS URL. Redirects are
/// refused, TLS verification is mandatory, and the body is limited.
pub async fn fetch_policy(domain: &str) -> Result<(Policy, String), Error> {
    let url = format!(
        "https://mta-sts.{}/.well-known/mta-sts.txt",
        domain.to_lowercase()
    );
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::PolicyFetch(e.to_string()))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::PolicyFetch(e.to_string()))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::NoPolicy);
    }
    if !response.status().is_success() {
        return Err(Error::PolicyFetch(format!(
            "http status {} while status 200 is required",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| Error::PolicyFetch(e.to_string()))?;
    if body.len() > MAX_POLICY_SIZE {
        return Err(Error::PolicySyntax("policy too large".to_string()));
    }
    let text = String::from_utf8_lossy(&body).to_string();
    let policy = parse_policy(&text)?;
    Ok((policy, text))
}

/// Parse a policy document.
pub fn parse_policy(text: &str) -> Result<Policy, Error> {
    let mut version = None;
    let mut mode = None;
    let mut max_age = None;
    let mut mx = Vec::new();
    let mut extensions = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| Error::PolicySyntax(format!("bad line {:?}", line)))?;
        let value = value.trim();
        match key.trim() {
            "version" => version = Some(value.to_string()),
            "mode" => mode = Some(Mode::parse(value)?),
            "max_age" => {
                max_age = Some(
                    value
                        .parse()
                        .map_err(|_| Error::PolicySyntax(format!("bad max_age {:?}", value)))?,
                )
            }
            "mx" => {
                let (wildcard, domain) = match value.strip_prefix("*.") {
                    Some(rest) => (true, rest),
                    None => (false, value),
                };
                if domain.is_empty() {
                    return Err(Error::PolicySyntax("empty mx".to_string()));
                }
                mx.push(MxHost {
                    wildcard,
                    domain: domain.to_lowercase(),
                });
            }
            key => extensions.push(Pair {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    let version = version.ok_or_else(|| Error::PolicySyntax("missing version".to_string()))?;
    if version != "STSv1" {
        return Err(Error::PolicySyntax(format!("unknown version {:?}", version)));
    }
    let mode = mode.ok_or_else(|| Error::PolicySyntax("missing mode".to_string()))?;
    let max_age_seconds =
        max_age.ok_or_else(|| Error::PolicySyntax("missing max_age".to_string()))?;
    if mode != Mode::None && mx.is_empty() {
        return Err(Error::PolicySyntax("missing mx".to_string()));
    }

    Ok(Policy {
        version,
        mode,
        mx,
        max_age_seconds,
        extensions,
    })
}

/// Look up the record and fetch the policy.
pub async fn get(resolver: &dyn Resolver, domain: &str) -> Result<(Record, Policy), Error> {
    let (record, cnames) = lookup_record(resolver, domain).await?;
    debug!(domain, record = %record, ?cnames, "mta-sts record");
    let (policy, _) = fetch_policy(domain).await?;
    Ok((record, policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use merel_common::dns::StubResolver;

    #[test]
    fn test_parse_record() {
        let (record, is_sts) = parse_record("v=STSv1; id=20160831085700Z").unwrap();
        assert!(is_sts);
        assert_eq!(record.version, "STSv1");
        assert_eq!(record.id, "20160831085700Z");
        assert_eq!(record.to_string(), "v=STSv1; id=20160831085700Z");

        let (_, is_sts) = parse_record("v=spf1 -all").unwrap();
        assert!(!is_sts);

        assert!(parse_record("v=STSv1;").is_err()); // missing id
    }

    #[test]
    fn test_parse_policy() {
        let text = "version: STSv1\nmode: enforce\nmx: mail.example.com\nmx: *.backup.example.com\nmax_age: 604800\n";
        let policy = parse_policy(text).unwrap();
        assert_eq!(policy.mode, Mode::Enforce);
        assert_eq!(policy.max_age_seconds, 604800);
        assert_eq!(policy.mx.len(), 2);
        assert!(policy.mx[1].wildcard);

        assert!(policy.matches("mail.example.com"));
        assert!(policy.matches("MAIL.example.com."));
        // Wildcard matches exactly one label.
        assert!(policy.matches("mx1.backup.example.com"));
        assert!(!policy.matches("backup.example.com"));
        assert!(!policy.matches("a.b.backup.example.com"));
        assert!(!policy.matches("elsewhere.example.com"));
    }

    #[test]
    fn test_parse_policy_requires_fields() {
        assert!(parse_policy("mode: enforce\nmax_age: 1\nmx: a.example\n").is_err());
        assert!(parse_policy("version: STSv1\nmax_age: 1\nmx: a.example\n").is_err());
        assert!(parse_policy("version: STSv1\nmode: enforce\nmx: a.example\n").is_err());
        assert!(parse_policy("version: STSv1\nmode: enforce\nmax_age: 1\n").is_err());
        // mode none needs no mx.
        assert!(parse_policy("version: STSv1\nmode: none\nmax_age: 1\n").is_ok());
    }

    #[tokio::test]
    async fn test_lookup_record() {
        let mut r = StubResolver::new();
        r.add_txt("_mta-sts.example.com", "v=STSv1; id=1234");

        let (record, cnames) = lookup_record(&r, "example.com").await.unwrap();
        assert_eq!(record.id, "1234");
        assert!(cnames.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_record_follows_cname() {
        let mut r = StubResolver::new();
        r.add_cname("_mta-sts.example.com", "sts.hosting.example");
        r.add_txt("sts.hosting.example", "v=STSv1; id=abcd");

        let (record, cnames) = lookup_record(&r, "example.com").await.unwrap();
        assert_eq!(record.id, "abcd");
        assert_eq!(cnames, vec!["sts.hosting.example".to_string()]);
    }

    #[tokio::test]
    async fn test_lookup_record_absent() {
        let r = StubResolver::new();
        assert!(matches!(
            lookup_record(&r, "example.com").await,
            Err(Error::NoRecord)
        ));
    }

    #[tokio::test]
    async fn test_lookup_record_multiple() {
        let mut r = StubResolver::new();
        r.add_txt("_mta-sts.example.com", "v=STSv1; id=1");
        r.add_txt("_mta-sts.example.com", "v=STSv1; id=2");
        assert!(matches!(
            lookup_record(&r, "example.com").await,
            Err(Error::MultipleRecords)
        ));
    }
}
