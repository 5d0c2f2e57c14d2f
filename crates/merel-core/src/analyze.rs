//! Inbound delivery analysis: the accept/reject/subjectpass decision.
//!
//! The SMTP front-end hands over one candidate delivery (message record,
//! message bytes, resolved account and destination, authentication
//! results) and receives a verdict with an SMTP code and a reason token.
//! The decision tree runs in strict order; the first definitive verdict
//! wins. Infrastructure trouble inside the analysis never turns into a
//! permanent refusal: it maps to a 451 so the sender retries.

use chrono::Duration;
use merel_common::clock::Clock;
use merel_common::config::{Config, Destination, Ruleset};
use merel_common::dns::Resolver;
use merel_common::smtp;
use merel_common::types::{EmailAddress, Validation};
use merel_storage::{Account, Message};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::dmarcrpt;
use crate::email_auth::dkim::DkimOutcome;
use crate::email_auth::dmarc::{DmarcEvaluation, DmarcStatus};
use crate::email_auth::dnsbl::{self, DnsblStatus};
use crate::email_auth::iprev::IprevStatus;
use crate::reputation::{reputation, ReputationMethod};
use crate::subjectpass;
use crate::tlsrpt;

pub const REASON_LIST_ALLOW: &str = "list-allow";
pub const REASON_DMARC_POLICY: &str = "dmarc-policy";
pub const REASON_REPUTATION_ERROR: &str = "reputation-error";
pub const REASON_REPORTING: &str = "reporting";
pub const REASON_SPF_POLICY: &str = "spf-policy";
pub const REASON_JUNK_CLASSIFY_ERROR: &str = "junk-classify-error";
pub const REASON_JUNK_FILTER_ERROR: &str = "junk-filter-error";
pub const REASON_GIVE_SUBJECTPASS: &str = "give-subjectpass";
pub const REASON_NO_BAD_SIGNALS: &str = "no-bad-signals";
pub const REASON_JUNK_CONTENT: &str = "junk-content";
pub const REASON_JUNK_CONTENT_STRICT: &str = "junk-content-strict";
pub const REASON_DNS_BLOCKLISTED: &str = "dns-blocklisted";
pub const REASON_SUBJECTPASS: &str = "subjectpass";
pub const REASON_SUBJECTPASS_ERROR: &str = "subjectpass-error";
pub const REASON_IPREV: &str = "iprev";

/// One candidate delivery, as assembled by the SMTP front-end.
pub struct Delivery<'a> {
    /// The message record under construction; the analysis fills in the
    /// destination mailbox ids.
    pub msg: &'a mut Message,
    /// Full message bytes (prefix plus data).
    pub data: &'a [u8],
    pub account: &'a Account,
    pub destination: &'a Destination,
    /// Canonical recipient address, keying the subjectpass secret.
    pub canonical_address: String,
    /// Parsed From-header address.
    pub msg_from: Option<EmailAddress>,
    /// Blocklist zones to consult.
    pub dns_bls: Vec<String>,
    pub dmarc: DmarcEvaluation,
    pub dkim_outcomes: Vec<DkimOutcome>,
    pub iprev: IprevStatus,
}

/// The verdict.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub accept: bool,
    pub code: u16,
    pub secode: String,
    /// Whether the rejection is a policy decision rather than our own
    /// infrastructure failing.
    pub user_error: bool,
    pub errmsg: String,
    /// Decision token, one of the REASON_* constants or a reputation
    /// method name.
    pub reason: String,
    /// Validated DMARC aggregate report, not yet stored.
    pub dmarc_report: Option<dmarcrpt::Feedback>,
    /// Validated TLS report, not yet stored.
    pub tls_report: Option<tlsrpt::Report>,
}

impl Analysis {
    fn accept(reason: &str) -> Self {
        Self {
            accept: true,
            code: 0,
            secode: String::new(),
            user_error: false,
            errmsg: String::new(),
            reason: reason.to_string(),
            dmarc_report: None,
            tls_report: None,
        }
    }

    fn reject(code: u16, secode: &str, errmsg: impl Into<String>, user_error: bool, reason: &str) -> Self {
        Self {
            accept: false,
            code,
            secode: secode.to_string(),
            user_error,
            errmsg: errmsg.into(),
            reason: reason.to_string(),
            dmarc_report: None,
            tls_report: None,
        }
    }
}

/// Analyze one inbound delivery.
pub async fn analyze(
    resolver: &dyn Resolver,
    clock: &dyn Clock,
    config: &Config,
    d: Delivery<'_>,
) -> Analysis {
    let now = clock.now();

    // A destination ruleset naming a mailing list domain lets list traffic
    // through on an authenticated list identity alone.
    let ruleset = match_ruleset(d.destination, &d.msg_from);
    if let Some(list_domain) = ruleset.and_then(|rs| rs.list_allow_domain.as_deref()) {
        let list_domain = list_domain.to_lowercase();
        if d.msg.mail_from_validated && d.msg.mail_from_domain == list_domain {
            return Analysis::accept(REASON_LIST_ALLOW);
        }
        if d.dkim_outcomes.iter().any(|o| o.is_pass_for(&list_domain)) {
            return Analysis::accept(REASON_LIST_ALLOW);
        }
    }

    if d.dmarc.in_use && d.dmarc.reject {
        return Analysis::reject(
            smtp::C550_MAILBOX_UNAVAIL,
            smtp::SE_POL7_MULTI_AUTH_FAILS_26,
            "rejecting per dmarc policy",
            true,
            REASON_DMARC_POLICY,
        );
    }

    // Report ingestion. The destination must be flagged for it and the
    // message must clear the authentication gate for its report type;
    // the validated report rides along to delivery.
    let mut dmarc_report = None;
    if d.destination.dmarc_reports {
        if d.dmarc.status != DmarcStatus::Pass {
            info!("received dmarc report without dmarc pass, not processing as dmarc report");
        } else {
            match dmarcrpt::parse_message(d.data) {
                Err(e) => info!(error = %e, "parsing dmarc report"),
                Ok(feedback) => {
                    let domain = feedback.policy_published.domain.clone();
                    if !config.is_local_domain(&domain) {
                        info!(domain, "dmarc report for domain not configured, ignoring");
                    } else if feedback.report_metadata.date_range.end > now.timestamp() + 60 {
                        info!(domain, "dmarc report with end date in the future, ignoring");
                    } else {
                        dmarc_report = Some(feedback);
                    }
                }
            }
        }
    }

    let mut tls_report = None;
    if d.destination.tls_reports {
        // A passing DKIM signature over the From domain, covering the whole
        // body, from a key allowing the tlsrpt service.
        let ok = d.dkim_outcomes.iter().any(|o| {
            d.msg_from.as_ref().is_some_and(|from| o.is_pass_for(&from.domain))
                && o.signature.as_ref().is_some_and(|s| s.body_length.is_none())
                && o.record.as_ref().is_some_and(|r| r.service_allowed("tlsrpt"))
        });
        if !ok {
            info!("received mail to tlsrpt without acceptable dkim signature, not processing as tls report");
        } else {
            match tlsrpt::parse_message(d.data) {
                Err(e) => info!(error = %e, "parsing tls report"),
                Ok(report) => {
                    let known = report
                        .policy_domains()
                        .iter()
                        .any(|domain| config.is_local_domain(domain));
                    if !known {
                        info!("tls report without one of configured domains, ignoring");
                    } else {
                        tls_report = Some(report);
                    }
                }
            }
        }
    }

    // Reputation, under the account read guard. The destination mailbox is
    // resolved first: reputation is per-mailbox, and a rejected copy must
    // remember where it was headed.
    let rep = {
        let _rl = d.account.read().await;

        let mailbox_name = ruleset
            .map(|rs| rs.mailbox.clone())
            .or_else(|| d.destination.mailbox.clone())
            .unwrap_or_else(|| "Inbox".to_string());
        match d.account.mailbox_find(&mailbox_name).await {
            Ok(Some(mb)) => {
                d.msg.mailbox_id = mb.id;
                d.msg.mailbox_destined_id = Some(mb.id);
            }
            Ok(None) => debug!(mailbox = %mailbox_name, "destination mailbox does not exist yet"),
            Err(e) => {
                warn!(error = %e, "finding destination mailbox");
                return Analysis::reject(
                    smtp::C451_LOCAL_ERR,
                    smtp::SE_SYS3_OTHER_0,
                    "error processing",
                    false,
                    REASON_REPUTATION_ERROR,
                );
            }
        }

        match reputation(d.account.db(), d.msg).await {
            Ok(rep) => rep,
            Err(e) => {
                warn!(error = %e, "determining reputation");
                return Analysis::reject(
                    smtp::C451_LOCAL_ERR,
                    smtp::SE_SYS3_OTHER_0,
                    "error processing",
                    false,
                    REASON_REPUTATION_ERROR,
                );
            }
        }
    };
    info!(
        conclusive = rep.conclusive,
        isjunk = ?rep.is_junk,
        method = rep.method.as_str(),
        "reputation analyzed"
    );

    if rep.conclusive {
        if rep.is_junk == Some(false) {
            let mut analysis = Analysis::accept(rep.method.as_str());
            analysis.dmarc_report = dmarc_report;
            analysis.tls_report = tls_report;
            return analysis;
        }
        return Analysis::reject(
            smtp::C451_LOCAL_ERR,
            smtp::SE_SYS3_OTHER_0,
            "error processing",
            true,
            rep.method.as_str(),
        );
    } else if dmarc_report.is_some() || tls_report.is_some() {
        info!("accepting dmarc reporting or tlsrpt message without reputation");
        let mut analysis = Analysis::accept(REASON_REPORTING);
        analysis.dmarc_report = dmarc_report;
        analysis.tls_report = tls_report;
        return analysis;
    }

    // No usable sender history and an SPF (soft)fail: not worth the risk.
    if rep.method.is_weak() {
        if matches!(
            d.msg.mail_from_validation(),
            Validation::Fail | Validation::Softfail
        ) {
            return Analysis::reject(
                smtp::C451_LOCAL_ERR,
                smtp::SE_SYS3_OTHER_0,
                "error processing",
                true,
                REASON_SPF_POLICY,
            );
        }
    }

    // Senders without reputation and without forward-confirmed reverse DNS
    // are likely spam.
    let suspicious_iprev = rep.method.is_weak() && d.iprev != IprevStatus::Pass;

    // With an existing mild junk signal, a failing iprev on top is enough.
    if suspicious_iprev && rep.is_junk == Some(true) {
        return Analysis::reject(
            smtp::C451_LOCAL_ERR,
            smtp::SE_SYS3_OTHER_0,
            "error processing",
            true,
            REASON_IPREV,
        );
    }

    let period = d.account.config().subjectpass_period_secs;
    let mut subjectpass_key = None;
    if period > 0 {
        match d.account.subjectpass_key(&d.canonical_address).await {
            Ok(key) => {
                let pass = subjectpass::verify(
                    d.data,
                    &key,
                    Duration::seconds(period as i64),
                    now,
                )
                .is_ok();
                debug!(pass, "subjectpass token check");
                if pass {
                    return Analysis::accept(REASON_SUBJECTPASS);
                }
                subjectpass_key = Some(key);
            }
            Err(e) => {
                error!(error = %e, "get key for verifying subject token");
                return Analysis::reject(
                    smtp::C451_LOCAL_ERR,
                    smtp::SE_SYS3_OTHER_0,
                    "error processing",
                    false,
                    REASON_SUBJECTPASS_ERROR,
                );
            }
        }
    }

    let mut reason = REASON_NO_BAD_SIGNALS;
    let mut accept = true;
    let mut junk_subjectpass = false;
    match d.account.open_junk_filter().await {
        Ok(jf) => {
            let base_threshold = jf.threshold();
            let classification = jf.classify(d.data).await;
            if let Err(e) = jf.close().await {
                warn!(error = %e, "closing junkfilter");
            }
            let classification = match classification {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "testing for spam");
                    return Analysis::reject(
                        smtp::C451_LOCAL_ERR,
                        smtp::SE_SYS3_OTHER_0,
                        "error processing",
                        false,
                        REASON_JUNK_CLASSIFY_ERROR,
                    );
                }
            };

            // Jitter the threshold so we are not a clean oracle for words
            // that strongly indicate ham.
            let jitter = (rand::thread_rng().gen::<f64>() - 0.5) / 10.0;
            let mut threshold = base_threshold + jitter;

            reason = REASON_JUNK_CONTENT;
            if suspicious_iprev && threshold > 0.25 {
                threshold = 0.25;
                info!(threshold, "tightening junk threshold due to iprev fail");
                reason = REASON_JUNK_CONTENT_STRICT;
            }
            accept = classification.probability <= threshold;
            junk_subjectpass = classification.probability < threshold - 0.2;
            info!(
                accept,
                probability = classification.probability,
                subjectpass = junk_subjectpass,
                "content analyzed"
            );
        }
        Err(merel_common::Error::NoJunkFilter) => {}
        Err(e) => {
            error!(error = %e, "open junkfilter");
            return Analysis::reject(
                smtp::C451_LOCAL_ERR,
                smtp::SE_SYS3_OTHER_0,
                "error processing",
                false,
                REASON_JUNK_FILTER_ERROR,
            );
        }
    }

    // Content looked fine; blocklists may still say otherwise. Checked
    // serially, we are in no hurry to accept likely spam.
    let mut dns_blocklisted = false;
    if accept {
        let ip: Option<std::net::IpAddr> = d.msg.remote_ip.parse().ok();
        if let Some(ip) = ip {
            for zone in &d.dns_bls {
                if !dnsbl::check_health(resolver, zone).await {
                    info!(zone, "dnsbl not healthy, skipping");
                    continue;
                }
                let (status, expl) = dnsbl::lookup(resolver, zone, ip).await;
                if status == DnsblStatus::Fail {
                    info!(zone, explanation = ?expl, "rejecting due to listing in dnsbl");
                    accept = false;
                    dns_blocklisted = true;
                    reason = REASON_DNS_BLOCKLISTED;
                    break;
                }
            }
        }
    }

    if accept {
        return Analysis::accept(REASON_NO_BAD_SIGNALS);
    }

    // Moderately spammy mail from a sender without history, but with a
    // passing DMARC: a token in the reject text lets a human retry.
    if let Some(key) = subjectpass_key {
        if d.dmarc.status == DmarcStatus::Pass
            && rep.method == ReputationMethod::None
            && (dns_blocklisted || junk_subjectpass)
        {
            if let Some(from) = &d.msg_from {
                info!("permanent reject with subjectpass hint of moderately spammy email without reputation");
                let token = subjectpass::generate(from, &key, now);
                return Analysis::reject(
                    smtp::C550_MAILBOX_UNAVAIL,
                    smtp::SE_POL7_DELIVERY_UNAUTH_1,
                    format!("{}{}", subjectpass::EXPLANATION, token),
                    true,
                    REASON_GIVE_SUBJECTPASS,
                );
            }
        }
    }

    Analysis::reject(
        smtp::C451_LOCAL_ERR,
        smtp::SE_SYS3_OTHER_0,
        "error processing",
        true,
        reason,
    )
}

/// First ruleset whose From-address pattern matches.
fn match_ruleset<'a>(
    destination: &'a Destination,
    msg_from: &Option<EmailAddress>,
) -> Option<&'a Ruleset> {
    for rs in &destination.rulesets {
        match &rs.msg_from_regex {
            None => return Some(rs),
            Some(pattern) => {
                let Some(from) = msg_from else { continue };
                match regex::Regex::new(pattern) {
                    Ok(re) => {
                        if re.is_match(&from.canonical()) {
                            return Some(rs);
                        }
                    }
                    Err(e) => warn!(pattern, error = %e, "invalid msg_from_regex in ruleset"),
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use merel_common::clock::{ManualClock, SystemClock};
    use merel_common::config::{AccountConfig, JunkFilterConfig};
    use merel_common::dns::StubResolver;
    use merel_common::types::FromValidation;
    use merel_storage::Store;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn base_config(dir: &TempDir) -> Config {
        let mut destinations = HashMap::new();
        destinations.insert(
            "mjl".to_string(),
            Destination {
                mailbox: Some("Inbox".to_string()),
                ..Destination::default()
            },
        );
        let account = AccountConfig {
            domain: "merel.example".to_string(),
            destinations,
            rejects_mailbox: Some("Rejects".to_string()),
            subjectpass_period_secs: 0,
            junk_filter: Some(JunkFilterConfig::default()),
        };
        let mut config: Config = toml::from_str("").unwrap();
        config.data_dir = dir.path().join("data");
        config.domains.insert("merel.example".to_string(), Default::default());
        config.accounts.insert("mjl".to_string(), account);
        config
    }

    async fn store_with(config: Config) -> (Arc<Config>, Store) {
        let config = Arc::new(config);
        let store = Store::open(config.clone()).await.unwrap();
        (config, store)
    }

    fn inbound(from: &str, ip: &str, data: &str) -> (Message, Vec<u8>, EmailAddress) {
        let rcpt = EmailAddress::parse("mjl@merel.example").unwrap();
        let from = EmailAddress::parse(from).unwrap();
        let mut msg = Message::new_inbound(ip.parse().unwrap(), Some(&from), &rcpt, Utc::now());
        msg.set_msg_from(&from, FromValidation::Dmarc);
        (msg, data.as_bytes().to_vec(), from)
    }

    fn plain_message(from: &str, subject: &str) -> String {
        format!("From: <{}>\r\nSubject: {}\r\n\r\nhello\r\n", from, subject)
    }

    async fn insert_junk(store: &Store, dir: &TempDir, from: &str, n: usize) {
        let acc = store.account("mjl").await.unwrap();
        for i in 0..n {
            let (mut msg, _, _) = inbound(from, "127.0.0.10", "");
            msg.junk = true;
            let path = dir.path().join(format!("j{}-{}.eml", i, rand::random::<u32>()));
            tokio::fs::write(&path, b"Subject: buy\r\n\r\ncasino lottery pills\r\n")
                .await
                .unwrap();
            acc.deliver(&mut msg, &path, false).await.unwrap();
        }
    }

    fn delivery<'a>(
        msg: &'a mut Message,
        data: &'a [u8],
        account: &'a Account,
        destination: &'a Destination,
        msg_from: EmailAddress,
    ) -> Delivery<'a> {
        Delivery {
            msg,
            data,
            account,
            destination,
            canonical_address: "mjl@merel.example".to_string(),
            msg_from: Some(msg_from),
            dns_bls: Vec::new(),
            dmarc: DmarcEvaluation::default(),
            dkim_outcomes: Vec::new(),
            iprev: IprevStatus::Pass,
        }
    }

    #[tokio::test]
    async fn test_unknown_sender_clean_history_accepted() {
        let dir = TempDir::new().unwrap();
        let (config, store) = store_with(base_config(&dir)).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let data = plain_message("remote@example.org", "hi");
        let (mut msg, data, from) = inbound("remote@example.org", "127.0.0.10", &data);
        let resolver = StubResolver::new();

        let analysis = analyze(
            &resolver,
            &SystemClock,
            &config,
            delivery(&mut msg, &data, &acc, &dest, from),
        )
        .await;
        assert!(analysis.accept, "reason: {}", analysis.reason);
        assert_eq!(analysis.reason, REASON_NO_BAD_SIGNALS);

        // The front-end delivers on accept; the message lands with a file
        // and a UID.
        let path = dir.path().join("in.eml");
        tokio::fs::write(&path, &data).await.unwrap();
        acc.deliver(&mut msg, &path, true).await.unwrap();
        assert_eq!(acc.message_count("Inbox").await.unwrap(), 1);
        assert!(msg.uid > 0);
    }

    #[tokio::test]
    async fn test_bad_reputation_rejected_and_copied_to_rejects() {
        let dir = TempDir::new().unwrap();
        let (config, store) = store_with(base_config(&dir)).await;
        insert_junk(&store, &dir, "remote@example.org", 3).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let data = plain_message("remote@example.org", "one more offer");
        let (mut msg, data, from) = inbound("remote@example.org", "127.0.0.10", &data);
        let resolver = StubResolver::new();

        let analysis = analyze(
            &resolver,
            &SystemClock,
            &config,
            delivery(&mut msg, &data, &acc, &dest, from),
        )
        .await;
        assert!(!analysis.accept);
        assert_eq!(analysis.code, smtp::C451_LOCAL_ERR);
        assert_eq!(analysis.secode, smtp::SE_SYS3_OTHER_0);
        assert_eq!(analysis.reason, "msgfrom-full");

        // Front-end behavior on reject: keep a copy in Rejects.
        let path = dir.path().join("rejected.eml");
        tokio::fs::write(&path, &data).await.unwrap();
        acc.deliver_mailbox("Rejects", &mut msg, &path, false).await.unwrap();
        assert_eq!(acc.message_count("Rejects").await.unwrap(), 1);
        assert!(msg.mailbox_destined_id.is_some());
    }

    #[tokio::test]
    async fn test_recent_recipient_reverses_verdict() {
        let dir = TempDir::new().unwrap();
        let (config, store) = store_with(base_config(&dir)).await;
        insert_junk(&store, &dir, "remote@example.org", 3).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let data = plain_message("remote@example.org", "re: our call");
        let (mut msg, data, from) = inbound("remote@example.org", "127.0.0.10", &data);
        let resolver = StubResolver::new();

        let analysis = analyze(
            &resolver,
            &SystemClock,
            &config,
            delivery(&mut msg, &data, &acc, &dest, from.clone()),
        )
        .await;
        assert!(!analysis.accept);

        // We wrote to this address; the same delivery now passes.
        acc.record_recipient(1, &from, Utc::now()).await.unwrap();
        let retry = plain_message("remote@example.org", "re: our call");
        let (mut msg, data, from) = inbound("remote@example.org", "127.0.0.10", &retry);
        let analysis = analyze(
            &resolver,
            &SystemClock,
            &config,
            delivery(&mut msg, &data, &acc, &dest, from),
        )
        .await;
        assert!(analysis.accept, "reason: {}", analysis.reason);
        assert_eq!(analysis.reason, "msgfrom-full");
    }

    #[tokio::test]
    async fn test_dnsbl_reject_with_subjectpass_hint_then_token_accepted() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        {
            let acc = config.accounts.get_mut("mjl").unwrap();
            acc.subjectpass_period_secs = 3600;
            acc.junk_filter = None;
        }
        config
            .domains
            .get_mut("merel.example")
            .unwrap()
            .dnsbl_zones
            .push("dnsbl.example".to_string());
        let (config, store) = store_with(config).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let mut resolver = StubResolver::new();
        // Healthy zone listing the client address.
        resolver.add_a("2.0.0.127.dnsbl.example", "127.0.0.2".parse().unwrap());
        resolver.add_a("10.0.0.127.dnsbl.example", "127.0.0.2".parse().unwrap());

        let clock = ManualClock::new(Utc::now());

        let data = plain_message("remote@example.org", "hello");
        let (mut msg, data, from) = inbound("remote@example.org", "127.0.0.10", &data);
        let mut d = delivery(&mut msg, &data, &acc, &dest, from.clone());
        d.dns_bls = vec!["dnsbl.example".to_string()];
        d.dmarc = DmarcEvaluation {
            in_use: true,
            status: DmarcStatus::Pass,
            reject: false,
        };

        let analysis = analyze(&resolver, &clock, &config, d).await;
        assert!(!analysis.accept);
        assert_eq!(analysis.code, smtp::C550_MAILBOX_UNAVAIL);
        assert_eq!(analysis.secode, smtp::SE_POL7_DELIVERY_UNAUTH_1);
        assert_eq!(analysis.reason, REASON_GIVE_SUBJECTPASS);
        let token_at = analysis.errmsg.find("(pass:").expect("token in explanation");
        let token = &analysis.errmsg[token_at..];

        // Retry with the token in the subject passes, before any dnsbl.
        let retry = plain_message("remote@example.org", &format!("hello {}", token));
        let (mut msg, retry, from) = inbound("remote@example.org", "127.0.0.10", &retry);
        let mut d = delivery(&mut msg, &retry, &acc, &dest, from);
        d.dns_bls = vec!["dnsbl.example".to_string()];
        d.dmarc = DmarcEvaluation {
            in_use: true,
            status: DmarcStatus::Pass,
            reject: false,
        };
        let analysis = analyze(&resolver, &clock, &config, d).await;
        assert!(analysis.accept, "reason: {}", analysis.reason);
        assert_eq!(analysis.reason, REASON_SUBJECTPASS);
    }

    #[tokio::test]
    async fn test_dnsbl_skipped_when_unhealthy() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.accounts.get_mut("mjl").unwrap().junk_filter = None;
        let (config, store) = store_with(config).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        // Zone lists the client but fails the health probe (no 127.0.0.2).
        let mut resolver = StubResolver::new();
        resolver.add_a("10.0.0.127.dnsbl.example", "127.0.0.2".parse().unwrap());

        let data = plain_message("remote@example.org", "hi");
        let (mut msg, data, from) = inbound("remote@example.org", "127.0.0.10", &data);
        let mut d = delivery(&mut msg, &data, &acc, &dest, from);
        d.dns_bls = vec!["dnsbl.example".to_string()];

        let analysis = analyze(&resolver, &SystemClock, &config, d).await;
        assert!(analysis.accept, "unhealthy zone must be skipped");
    }

    #[tokio::test]
    async fn test_dmarc_policy_reject() {
        let dir = TempDir::new().unwrap();
        let (config, store) = store_with(base_config(&dir)).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let data = plain_message("remote@example.org", "hi");
        let (mut msg, data, from) = inbound("remote@example.org", "127.0.0.10", &data);
        let mut d = delivery(&mut msg, &data, &acc, &dest, from);
        d.dmarc = DmarcEvaluation {
            in_use: true,
            status: DmarcStatus::Fail,
            reject: true,
        };

        let resolver = StubResolver::new();
        let analysis = analyze(&resolver, &SystemClock, &config, d).await;
        assert!(!analysis.accept);
        assert_eq!(analysis.code, smtp::C550_MAILBOX_UNAVAIL);
        assert_eq!(analysis.secode, smtp::SE_POL7_MULTI_AUTH_FAILS_26);
        assert_eq!(analysis.reason, REASON_DMARC_POLICY);
    }

    #[tokio::test]
    async fn test_list_allow_accepts_on_dkim_identity() {
        use crate::email_auth::dkim::{DkimOutcome, DkimRecord, DkimSignature, DkimStatus};

        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config
            .accounts
            .get_mut("mjl")
            .unwrap()
            .destinations
            .get_mut("mjl")
            .unwrap()
            .rulesets
            .push(Ruleset {
                msg_from_regex: None,
                list_allow_domain: Some("lists.example".to_string()),
                mailbox: "Lists".to_string(),
            });
        let (config, store) = store_with(config).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let data = plain_message("announce@lists.example", "news");
        let (mut msg, data, from) = inbound("announce@lists.example", "127.0.0.10", &data);
        let mut d = delivery(&mut msg, &data, &acc, &dest, from);
        d.dkim_outcomes = vec![DkimOutcome {
            status: DkimStatus::Pass,
            signature: Some(DkimSignature {
                domain: "lists.example".to_string(),
                selector: "sel".to_string(),
                algorithm: "rsa-sha256".to_string(),
                header_canon: Default::default(),
                body_canon: Default::default(),
                signed_headers: vec!["from".to_string()],
                body_hash: Vec::new(),
                signature: Vec::new(),
                body_length: None,
            }),
            record: Some(DkimRecord::default()),
        }];

        let resolver = StubResolver::new();
        let analysis = analyze(&resolver, &SystemClock, &config, d).await;
        assert!(analysis.accept);
        assert_eq!(analysis.reason, REASON_LIST_ALLOW);
    }

    #[tokio::test]
    async fn test_tls_report_ingestion_requires_local_policy_domain() {
        use crate::email_auth::dkim::{DkimOutcome, DkimRecord, DkimSignature, DkimStatus};

        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        {
            let acc = config.accounts.get_mut("mjl").unwrap();
            acc.junk_filter = None;
            acc.destinations.get_mut("mjl").unwrap().tls_reports = true;
        }
        let (config, store) = store_with(config).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let aligned_outcome = |domain: &str| DkimOutcome {
            status: DkimStatus::Pass,
            signature: Some(DkimSignature {
                domain: domain.to_string(),
                selector: "sel".to_string(),
                algorithm: "rsa-sha256".to_string(),
                header_canon: Default::default(),
                body_canon: Default::default(),
                signed_headers: vec!["from".to_string()],
                body_hash: Vec::new(),
                signature: Vec::new(),
                body_length: None,
            }),
            record: Some(DkimRecord {
                public_key: Vec::new(),
                services: vec!["tlsrpt".to_string()],
            }),
        };

        // Report about a domain we serve: carried through.
        let report_msg = format!(
            "From: <reporter@reporter.example>\r\nSubject: tls report\r\nContent-Type: application/tlsrpt+json\r\n\r\n{}",
            crate::tlsrpt::SAMPLE_REPORT
        );
        let (mut msg, data, from) = inbound("reporter@reporter.example", "127.0.0.10", &report_msg);
        let mut d = delivery(&mut msg, &data, &acc, &dest, from);
        d.dkim_outcomes = vec![aligned_outcome("reporter.example")];

        let resolver = StubResolver::new();
        let analysis = analyze(&resolver, &SystemClock, &config, d).await;
        assert!(analysis.accept);
        assert_eq!(analysis.reason, REASON_REPORTING);
        assert!(analysis.tls_report.is_some());

        // The front-end stores the carried report after delivery.
        let reports = crate::reportdb::TlsReportStore::open(&config.data_dir).await.unwrap();
        reports
            .add(analysis.tls_report.as_ref().unwrap(), Utc::now())
            .await
            .unwrap();
        assert_eq!(reports.count_for_domain("merel.example").await.unwrap(), 1);

        // Same message but about a foreign domain: accepted as ordinary
        // mail, no report extracted.
        let foreign = crate::tlsrpt::SAMPLE_REPORT.replace("merel.example", "other.example");
        let report_msg = format!(
            "From: <reporter@reporter.example>\r\nSubject: tls report\r\nContent-Type: application/tlsrpt+json\r\n\r\n{}",
            foreign
        );
        let (mut msg, data, from) = inbound("reporter@reporter.example", "127.0.0.10", &report_msg);
        let mut d = delivery(&mut msg, &data, &acc, &dest, from);
        d.dkim_outcomes = vec![aligned_outcome("reporter.example")];
        let analysis = analyze(&resolver, &SystemClock, &config, d).await;
        assert!(analysis.tls_report.is_none());
        assert_eq!(analysis.reason, REASON_NO_BAD_SIGNALS);
        assert_eq!(reports.count_for_domain("other.example").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dmarc_report_future_date_range_discarded() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        {
            let acc = config.accounts.get_mut("mjl").unwrap();
            acc.junk_filter = None;
            acc.destinations.get_mut("mjl").unwrap().dmarc_reports = true;
        }
        let (config, store) = store_with(config).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let clock = ManualClock::new(Utc::now());
        let future_end = clock.now().timestamp() + 3600;
        let xml = crate::dmarcrpt::sample_report("merel.example", future_end);
        let report_msg = format!(
            "From: <noreply@reporter.example>\r\nSubject: dmarc report\r\nContent-Type: application/xml\r\n\r\n{}",
            xml
        );
        let (mut msg, data, from) = inbound("noreply@reporter.example", "127.0.0.10", &report_msg);
        let mut d = delivery(&mut msg, &data, &acc, &dest, from);
        d.dmarc = DmarcEvaluation {
            in_use: true,
            status: DmarcStatus::Pass,
            reject: false,
        };

        let resolver = StubResolver::new();
        let analysis = analyze(&resolver, &clock, &config, d).await;
        // Future-dated report is discarded; the message is ordinary mail.
        assert!(analysis.dmarc_report.is_none());

        // A current report is carried through.
        let xml = crate::dmarcrpt::sample_report("merel.example", clock.now().timestamp() - 60);
        let report_msg = format!(
            "From: <noreply@reporter.example>\r\nSubject: dmarc report\r\nContent-Type: application/xml\r\n\r\n{}",
            xml
        );
        let (mut msg, data, from) = inbound("noreply@reporter.example", "127.0.0.10", &report_msg);
        let mut d = delivery(&mut msg, &data, &acc, &dest, from);
        d.dmarc = DmarcEvaluation {
            in_use: true,
            status: DmarcStatus::Pass,
            reject: false,
        };
        let analysis = analyze(&resolver, &clock, &config, d).await;
        assert!(analysis.dmarc_report.is_some());
        assert_eq!(analysis.reason, REASON_REPORTING);
    }

    #[tokio::test]
    async fn test_spf_softfail_without_history_rejected() {
        let dir = TempDir::new().unwrap();
        let (config, store) = store_with(base_config(&dir)).await;
        let (acc, _, dest) = store.open_email("mjl@merel.example").await.unwrap();

        let data = plain_message("remote@example.org", "hi");
        let (mut msg, data, from) = inbound("remote@example.org", "127.0.0.10", &data);
        msg.set_mail_from_validation(Validation::Softfail);
        msg.msg_from_validated = false;
        let d = delivery(&mut msg, &data, &acc, &dest, from);

        let resolver = StubResolver::new();
        let analysis = analyze(&resolver, &SystemClock, &config, d).await;
        assert!(!analysis.accept);
        assert_eq!(analysis.reason, REASON_SPF_POLICY);
        assert_eq!(analysis.code, smtp::C451_LOCAL_ERR);
    }
}
