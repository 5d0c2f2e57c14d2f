//! Sender reputation from per-account message history.
//!
//! Probes prior messages the user has flagged junk or notjunk, matching
//! progressively coarser identifiers of the new message: exact From
//! address, From domain, organizational domain, authenticated
//! SPF/DKIM identities, and finally masked variants of the remote IP.
//! The first identifier with enough history decides; thinner history
//! yields a tentative signal the analysis can combine with other
//! evidence. A recent outgoing message to the sender short-circuits
//! everything as conclusive ham.
//!
//! The verdict is a pure function of the new message and the account's
//! prior rows.

use merel_common::Result;
use merel_storage::Message;
use sqlx::SqlitePool;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationMethod {
    MsgFromFull,
    MsgFromDomain,
    MsgFromOrg,
    DkimSpf,
    Ip1,
    Ip2,
    Ip3,
    None,
}

impl ReputationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReputationMethod::MsgFromFull => "msgfrom-full",
            ReputationMethod::MsgFromDomain => "msgfrom-domain",
            ReputationMethod::MsgFromOrg => "msgfrom-org",
            ReputationMethod::DkimSpf => "dkim-spf",
            ReputationMethod::Ip1 => "ip1",
            ReputationMethod::Ip2 => "ip2",
            ReputationMethod::Ip3 => "ip3",
            ReputationMethod::None => "none",
        }
    }

    /// Methods based on weak identifiers, where missing SPF or reverse-DNS
    /// signals carry extra weight in the analysis.
    pub fn is_weak(&self) -> bool {
        matches!(
            self,
            ReputationMethod::DkimSpf
                | ReputationMethod::Ip1
                | ReputationMethod::Ip2
                | ReputationMethod::Ip3
                | ReputationMethod::None
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reputation {
    /// The verdict; None when there is no history at all.
    pub is_junk: Option<bool>,
    /// Whether enough history backed the verdict to act on it alone.
    pub conclusive: bool,
    pub method: ReputationMethod,
}

impl Reputation {
    fn none() -> Self {
        Self {
            is_junk: None,
            conclusive: false,
            method: ReputationMethod::None,
        }
    }
}

struct Probe {
    method: ReputationMethod,
    min_n: i64,
}

/// Compute the reputation of a new, not yet delivered message against the
/// account database.
pub async fn reputation(db: &SqlitePool, msg: &Message) -> Result<Reputation> {
    // A sender we recently wrote to is ham, full stop.
    if !msg.msg_from_localpart.is_empty() {
        let sent: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM recipients WHERE localpart = ? AND domain = ?",
        )
        .bind(&msg.msg_from_localpart)
        .bind(&msg.msg_from_domain)
        .fetch_one(db)
        .await
        .map_err(db_err)?;
        if sent.0 > 0 {
            debug!(from = %format!("{}@{}", msg.msg_from_localpart, msg.msg_from_domain),
                "sender in outgoing recipient history");
            return Ok(Reputation {
                is_junk: Some(false),
                conclusive: true,
                method: ReputationMethod::MsgFromFull,
            });
        }
    }

    let probes = [
        Probe { method: ReputationMethod::MsgFromFull, min_n: 1 },
        Probe { method: ReputationMethod::MsgFromDomain, min_n: 3 },
        Probe { method: ReputationMethod::MsgFromOrg, min_n: 5 },
        Probe { method: ReputationMethod::DkimSpf, min_n: 5 },
        Probe { method: ReputationMethod::Ip1, min_n: 5 },
        Probe { method: ReputationMethod::Ip2, min_n: 5 },
        Probe { method: ReputationMethod::Ip3, min_n: 10 },
    ];

    let mut tentative: Option<Reputation> = None;
    for probe in probes {
        let Some((junk, total)) = count(db, probe.method, msg).await? else {
            continue;
        };
        if total == 0 {
            continue;
        }

        let is_junk = match probe.method {
            // A single junk flag on the exact address decides.
            ReputationMethod::MsgFromFull => junk > 0,
            _ => junk * 2 >= total,
        };
        if total >= probe.min_n {
            debug!(method = probe.method.as_str(), junk, total, "conclusive reputation");
            return Ok(Reputation {
                is_junk: Some(is_junk),
                conclusive: true,
                method: probe.method,
            });
        }
        if tentative.is_none() {
            tentative = Some(Reputation {
                is_junk: Some(is_junk),
                conclusive: false,
                method: probe.method,
            });
        }
    }

    Ok(tentative.unwrap_or_else(Reputation::none))
}

/// Junk and total counts of flagged prior messages matching the probe's
/// identifier, or None when the new message lacks that identifier.
async fn count(
    db: &SqlitePool,
    method: ReputationMethod,
    msg: &Message,
) -> Result<Option<(i64, i64)>> {
    const FLAGGED: &str = "(junk = 1 OR notjunk = 1)";
    let row: (i64, i64) = match method {
        ReputationMethod::MsgFromFull => {
            if msg.msg_from_localpart.is_empty() || !msg.msg_from_validated {
                return Ok(None);
            }
            sqlx::query_as(&format!(
                "SELECT COALESCE(SUM(junk), 0), COUNT(*) FROM messages
                 WHERE {} AND msg_from_validated = 1
                   AND msg_from_localpart = ? AND msg_from_domain = ?",
                FLAGGED
            ))
            .bind(&msg.msg_from_localpart)
            .bind(&msg.msg_from_domain)
            .fetch_one(db)
            .await
            .map_err(db_err)?
        }
        ReputationMethod::MsgFromDomain => {
            if msg.msg_from_domain.is_empty() || !msg.msg_from_validated {
                return Ok(None);
            }
            sqlx::query_as(&format!(
                "SELECT COALESCE(SUM(junk), 0), COUNT(*) FROM messages
                 WHERE {} AND msg_from_validated = 1 AND msg_from_domain = ?",
                FLAGGED
            ))
            .bind(&msg.msg_from_domain)
            .fetch_one(db)
            .await
            .map_err(db_err)?
        }
        ReputationMethod::MsgFromOrg => {
            if msg.msg_from_org_domain.is_empty() || !msg.msg_from_validated {
                return Ok(None);
            }
            sqlx::query_as(&format!(
                "SELECT COALESCE(SUM(junk), 0), COUNT(*) FROM messages
                 WHERE {} AND msg_from_validated = 1 AND msg_from_org_domain = ?",
                FLAGGED
            ))
            .bind(&msg.msg_from_org_domain)
            .fetch_one(db)
            .await
            .map_err(db_err)?
        }
        ReputationMethod::DkimSpf => {
            let spf = msg.mail_from_validated && !msg.mail_from_domain.is_empty();
            let dkim = msg.msg_from_validated && !msg.msg_from_domain.is_empty();
            if !spf && !dkim {
                return Ok(None);
            }
            sqlx::query_as(&format!(
                "SELECT COALESCE(SUM(junk), 0), COUNT(*) FROM messages
                 WHERE {} AND (
                       (? AND mail_from_validated = 1 AND mail_from_domain = ?)
                    OR (? AND msg_from_validated = 1 AND msg_from_domain = ?))",
                FLAGGED
            ))
            .bind(spf)
            .bind(&msg.mail_from_domain)
            .bind(dkim)
            .bind(&msg.msg_from_domain)
            .fetch_one(db)
            .await
            .map_err(db_err)?
        }
        ReputationMethod::Ip1 | ReputationMethod::Ip2 | ReputationMethod::Ip3 => {
            let (column, value) = match method {
                ReputationMethod::Ip1 => ("remote_ip_masked1", &msg.remote_ip_masked1),
                ReputationMethod::Ip2 => ("remote_ip_masked2", &msg.remote_ip_masked2),
                _ => ("remote_ip_masked3", &msg.remote_ip_masked3),
            };
            if value.is_empty() {
                return Ok(None);
            }
            sqlx::query_as(&format!(
                "SELECT COALESCE(SUM(junk), 0), COUNT(*) FROM messages WHERE {} AND {} = ?",
                FLAGGED, column
            ))
            .bind(value)
            .fetch_one(db)
            .await
            .map_err(db_err)?
        }
        ReputationMethod::None => return Ok(None),
    };
    Ok(Some(row))
}

fn db_err(e: sqlx::Error) -> merel_common::Error {
    merel_common::Error::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use merel_common::config::AccountConfig;
    use merel_common::types::{EmailAddress, FromValidation};
    use merel_storage::Account;
    use tempfile::TempDir;

    async fn account(dir: &TempDir) -> Account {
        Account::open("mjl", dir.path(), AccountConfig::default()).await.unwrap()
    }

    async fn insert(acc: &Account, dir: &TempDir, from: &str, ip: &str, junk: bool) -> Message {
        let rcpt = EmailAddress::parse("mjl@merel.example").unwrap();
        let from = EmailAddress::parse(from).unwrap();
        let mut msg = Message::new_inbound(ip.parse().unwrap(), Some(&from), &rcpt, Utc::now());
        msg.set_msg_from(&from, FromValidation::Dmarc);
        if junk {
            msg.junk = true;
        } else {
            msg.notjunk = true;
        }
        let path = dir.path().join(format!("m-{}.eml", rand::random::<u32>()));
        tokio::fs::write(&path, b"Subject: x\r\n\r\n").await.unwrap();
        acc.deliver(&mut msg, &path, false).await.unwrap();
        msg
    }

    fn incoming(from: &str, ip: &str) -> Message {
        let rcpt = EmailAddress::parse("mjl@merel.example").unwrap();
        let from = EmailAddress::parse(from).unwrap();
        let mut msg =
            Message::new_inbound(ip.parse().unwrap(), Some(&from), &rcpt, Utc::now());
        msg.set_msg_from(&from, FromValidation::Dmarc);
        msg
    }

    #[tokio::test]
    async fn test_no_history() {
        let dir = TempDir::new().unwrap();
        let acc = account(&dir).await;
        let rep = reputation(acc.db(), &incoming("remote@example.org", "127.0.0.10"))
            .await
            .unwrap();
        assert_eq!(rep.is_junk, None);
        assert!(!rep.conclusive);
        assert_eq!(rep.method, ReputationMethod::None);
    }

    #[tokio::test]
    async fn test_single_junk_from_address_is_conclusive() {
        let dir = TempDir::new().unwrap();
        let acc = account(&dir).await;
        insert(&acc, &dir, "remote@example.org", "127.0.0.10", true).await;

        let rep = reputation(acc.db(), &incoming("remote@example.org", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(rep.is_junk, Some(true));
        assert!(rep.conclusive);
        assert_eq!(rep.method, ReputationMethod::MsgFromFull);
    }

    #[tokio::test]
    async fn test_domain_reputation_needs_three() {
        let dir = TempDir::new().unwrap();
        let acc = account(&dir).await;
        insert(&acc, &dir, "a@example.org", "127.0.0.10", true).await;
        insert(&acc, &dir, "b@example.org", "127.0.0.10", true).await;

        // Two flagged messages: tentative, not conclusive.
        let rep = reputation(acc.db(), &incoming("c@example.org", "10.0.0.1"))
            .await
            .unwrap();
        assert!(!rep.conclusive);
        assert_eq!(rep.is_junk, Some(true));
        assert_eq!(rep.method, ReputationMethod::MsgFromDomain);

        insert(&acc, &dir, "d@example.org", "127.0.0.10", true).await;
        let rep = reputation(acc.db(), &incoming("c@example.org", "10.0.0.1"))
            .await
            .unwrap();
        assert!(rep.conclusive);
        assert_eq!(rep.is_junk, Some(true));
        assert_eq!(rep.method, ReputationMethod::MsgFromDomain);
    }

    #[tokio::test]
    async fn test_recent_recipient_short_circuits() {
        let dir = TempDir::new().unwrap();
        let acc = account(&dir).await;
        insert(&acc, &dir, "remote@example.org", "127.0.0.10", true).await;

        let addr = EmailAddress::parse("remote@example.org").unwrap();
        acc.record_recipient(1, &addr, Utc::now()).await.unwrap();

        let rep = reputation(acc.db(), &incoming("remote@example.org", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(rep.is_junk, Some(false));
        assert!(rep.conclusive);
    }

    #[tokio::test]
    async fn test_ip_bucket_reputation() {
        let dir = TempDir::new().unwrap();
        let acc = account(&dir).await;
        // Five junk messages from unrelated senders in the same /24.
        for i in 0..5 {
            insert(
                &acc,
                &dir,
                &format!("s{}@spam{}.example", i, i),
                &format!("10.20.30.{}", 40 + i),
                true,
            )
            .await;
        }

        let mut msg = incoming("fresh@elsewhere.example", "10.20.30.99");
        // The From identity has no history; make it unvalidated so only the
        // IP buckets match.
        msg.msg_from_validated = false;
        let rep = reputation(acc.db(), &msg).await.unwrap();
        assert!(rep.conclusive);
        assert_eq!(rep.is_junk, Some(true));
        assert_eq!(rep.method, ReputationMethod::Ip2);
    }

    #[tokio::test]
    async fn test_pure_over_identical_history() {
        let dir = TempDir::new().unwrap();
        let acc = account(&dir).await;
        insert(&acc, &dir, "remote@example.org", "127.0.0.10", true).await;

        let msg = incoming("remote@example.org", "10.0.0.1");
        let a = reputation(acc.db(), &msg).await.unwrap();
        let b = reputation(acc.db(), &msg).await.unwrap();
        assert_eq!(a.is_junk, b.is_junk);
        assert_eq!(a.conclusive, b.conclusive);
        assert_eq!(a.method, b.method);
    }
}
