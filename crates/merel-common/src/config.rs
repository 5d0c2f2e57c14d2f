//! Configuration for merel

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::EmailAddress;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory holding accounts, the queue and key material.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Our hostname, used in DSNs and EHLO for outbound delivery.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Default log level, adjustable at runtime over the control socket.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Locally served domains, keyed by domain name.
    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,

    /// Accounts, keyed by account name.
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,

    /// Outbound delivery queue tuning.
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Per-domain configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DomainConfig {
    /// DNS blocklist zones consulted for deliveries to this domain.
    #[serde(default)]
    pub dnsbl_zones: Vec<String>,
}

/// Per-account configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountConfig {
    /// The domain this account receives mail for.
    pub domain: String,

    /// Destinations keyed by lowercased localpart. The empty string is the
    /// catchall destination.
    #[serde(default)]
    pub destinations: HashMap<String, Destination>,

    /// Mailbox that receives refused messages so false positives can be
    /// recovered. No copy is kept when unset.
    pub rejects_mailbox: Option<String>,

    /// Subjectpass token validity in seconds. Zero or absent disables the
    /// subjectpass challenge.
    #[serde(default)]
    pub subjectpass_period_secs: u64,

    /// Junk filter settings; absent means no content classification.
    pub junk_filter: Option<JunkFilterConfig>,
}

impl AccountConfig {
    /// Find the destination for a localpart, falling back to the catchall.
    /// Localparts are matched case-insensitively.
    pub fn destination(&self, localpart: &str) -> Option<(&str, &Destination)> {
        let lower = localpart.to_lowercase();
        if let Some((lp, dest)) = self.destinations.get_key_value(lower.as_str()) {
            return Some((lp.as_str(), dest));
        }
        self.destinations
            .get_key_value("")
            .map(|(lp, dest)| (lp.as_str(), dest))
    }
}

/// Delivery destination for an address
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Destination {
    /// Mailbox to deliver to; "Inbox" when unset.
    pub mailbox: Option<String>,

    /// Message rulesets, evaluated in order; first match wins.
    #[serde(default)]
    pub rulesets: Vec<Ruleset>,

    /// This destination receives DMARC aggregate reports.
    #[serde(default)]
    pub dmarc_reports: bool,

    /// This destination receives TLS reports.
    #[serde(default)]
    pub tls_reports: bool,
}

/// A per-destination message rule
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ruleset {
    /// Regular expression matched against the canonical From-header address.
    pub msg_from_regex: Option<String>,

    /// Mailing list domain: SPF-validated MAIL FROM or a DKIM pass from
    /// this domain bypasses the junk checks.
    pub list_allow_domain: Option<String>,

    /// Mailbox to deliver matching messages to.
    pub mailbox: String,
}

/// Junk filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JunkFilterConfig {
    /// Classification probability above which a message is junk.
    #[serde(default = "default_junk_threshold")]
    pub threshold: f64,

    /// How many of the most significant words participate in the
    /// probability combination.
    #[serde(default = "default_top_words")]
    pub top_words: usize,
}

impl Default for JunkFilterConfig {
    fn default() -> Self {
        Self {
            threshold: default_junk_threshold(),
            top_words: default_top_words(),
        }
    }
}

fn default_junk_threshold() -> f64 {
    0.95
}

fn default_top_words() -> usize {
    20
}

/// Delivery queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before a message is returned to the sender. The default,
    /// together with the backoff schedule, gives up after about three days.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    /// Delay before the first retry, in seconds.
    #[serde(default = "default_first_retry_secs")]
    pub first_retry_secs: u64,

    /// Backoff cap, in seconds.
    #[serde(default = "default_max_retry_secs")]
    pub max_retry_secs: u64,

    /// Concurrent delivery attempts per destination domain.
    #[serde(default = "default_domain_concurrency")]
    pub max_domain_concurrency: usize,

    /// Concurrent delivery attempts overall.
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            first_retry_secs: default_first_retry_secs(),
            max_retry_secs: default_max_retry_secs(),
            max_domain_concurrency: default_domain_concurrency(),
            max_concurrency: default_concurrency(),
        }
    }
}

fn default_max_attempts() -> i64 {
    9
}

fn default_first_retry_secs() -> u64 {
    450
}

fn default_max_retry_secs() -> u64 {
    24 * 3600
}

fn default_domain_concurrency() -> usize {
    2
}

fn default_concurrency() -> usize {
    16
}

impl Config {
    /// Load configuration from a toml file.
    pub fn load_path(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("reading {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.check()?;
        Ok(config)
    }

    /// Load configuration from conventional locations.
    pub fn load() -> crate::Result<Self> {
        for path in [
            PathBuf::from("./merel.toml"),
            PathBuf::from("/etc/merel/merel.toml"),
        ] {
            if path.exists() {
                return Self::load_path(&path);
            }
        }
        Err(crate::Error::Config("no configuration file found".to_string()))
    }

    /// Basic cross-reference checks.
    pub fn check(&self) -> crate::Result<()> {
        for (name, acc) in &self.accounts {
            if !self.domains.contains_key(&acc.domain) {
                return Err(crate::Error::Config(format!(
                    "account {} references unknown domain {}",
                    name, acc.domain
                )));
            }
        }
        Ok(())
    }

    /// Whether a domain is served locally.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.contains_key(&domain.to_lowercase())
    }

    /// Find the account and destination for a recipient address.
    ///
    /// Returns the account name, its config, the canonical address and the
    /// destination. Localparts fold case; unknown localparts fall back to
    /// the account catchall when configured.
    pub fn find_destination(
        &self,
        addr: &EmailAddress,
    ) -> Option<(String, &AccountConfig, String, &Destination)> {
        for (name, acc) in &self.accounts {
            if acc.domain != addr.domain {
                continue;
            }
            if let Some((lp, dest)) = acc.destination(&addr.localpart) {
                let canonical = if lp.is_empty() {
                    addr.canonical()
                } else {
                    format!("{}@{}", lp, addr.domain)
                };
                return Some((name.clone(), acc, canonical, dest));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parse() {
        let toml = r#"
            hostname = "mail.example.com"

            [domains."example.com"]
            dnsbl_zones = ["dnsbl.example"]

            [accounts.mjl]
            domain = "example.com"
            rejects_mailbox = "Rejects"
            subjectpass_period_secs = 3600

            [accounts.mjl.destinations.mjl]
            mailbox = "Inbox"

            [accounts.mjl.junk_filter]
            threshold = 0.9
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.check().unwrap();

        assert_eq!(config.hostname, "mail.example.com");
        assert_eq!(config.queue.max_attempts, 9);
        let acc = &config.accounts["mjl"];
        assert_eq!(acc.junk_filter.as_ref().unwrap().threshold, 0.9);
        assert_eq!(acc.junk_filter.as_ref().unwrap().top_words, 20);

        let addr = EmailAddress::parse("MJL@example.com").unwrap();
        let (name, _, canonical, dest) = config.find_destination(&addr).unwrap();
        assert_eq!(name, "mjl");
        assert_eq!(canonical, "mjl@example.com");
        assert!(dest.rulesets.is_empty());
    }

    #[test]
    fn test_config_catchall() {
        let toml = r#"
            [domains."example.com"]

            [accounts.all]
            domain = "example.com"

            [accounts.all.destinations.""]
            mailbox = "Inbox"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let addr = EmailAddress::parse("anyone@example.com").unwrap();
        let (name, _, canonical, _) = config.find_destination(&addr).unwrap();
        assert_eq!(name, "all");
        assert_eq!(canonical, "anyone@example.com");
    }

    #[test]
    fn test_config_unknown_domain_rejected() {
        let toml = r#"
            [accounts.mjl]
            domain = "nosuch.example"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.check().is_err());
    }
}
