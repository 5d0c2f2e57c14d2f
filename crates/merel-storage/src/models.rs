//! Database models

use chrono::{DateTime, Utc};
use merel_common::types::{
    masked_ips, organizational_domain, EmailAddress, FromValidation, MessageFlags, Validation,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A delivered message. Immutable after creation except for flags and
/// keywords; `size == msg_prefix.len() + size of the message file`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    /// Mailbox the message is in.
    pub mailbox_id: i64,
    /// Intended mailbox when the message was diverted to Rejects.
    pub mailbox_destined_id: Option<i64>,
    /// Mailbox the message counts towards for reputation. Normally equal to
    /// mailbox_id; recomputed when a message moves out of Rejects.
    pub mailbox_orig_id: i64,
    pub uid: i64,
    pub received_at: DateTime<Utc>,
    pub size: i64,
    /// Bytes prepended to the on-disk file to form the full message, so
    /// headers can be added without rewriting the file.
    pub msg_prefix: Vec<u8>,

    pub remote_ip: String,
    pub remote_ip_masked1: String,
    pub remote_ip_masked2: String,
    pub remote_ip_masked3: String,

    pub mail_from_localpart: String,
    pub mail_from_domain: String,
    pub mail_from_validated: bool,
    pub mail_from_validation: String,

    pub rcpt_to_localpart: String,
    pub rcpt_to_domain: String,

    pub msg_from_localpart: String,
    pub msg_from_domain: String,
    pub msg_from_org_domain: String,
    pub msg_from_validated: bool,
    pub msg_from_validation: String,

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

    /// Lowercase tags, JSON-encoded list.
    pub keywords: String,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: 0,
            mailbox_id: 0,
            mailbox_destined_id: None,
            mailbox_orig_id: 0,
            uid: 0,
            received_at: Utc::now(),
            size: 0,
            msg_prefix: Vec::new(),
            remote_ip: String::new(),
            remote_ip_masked1: String::new(),
            remote_ip_masked2: String::new(),
            remote_ip_masked3: String::new(),
            mail_from_localpart: String::new(),
            mail_from_domain: String::new(),
            mail_from_validated: false,
            mail_from_validation: Validation::None.as_str().to_string(),
            rcpt_to_localpart: String::new(),
            rcpt_to_domain: String::new(),
            msg_from_localpart: String::new(),
            msg_from_domain: String::new(),
            msg_from_org_domain: String::new(),
            msg_from_validated: false,
            msg_from_validation: FromValidation::None.as_str().to_string(),
            seen: false,
            answered: false,
            flagged: false,
            deleted: false,
            draft: false,
            junk: false,
            notjunk: false,
            forwarded: false,
            phishing: false,
            mdnsent: false,
            keywords: "[]".to_string(),
        }
    }
}

impl Message {
    /// Start a message record for an inbound delivery.
    pub fn new_inbound(
        remote_ip: std::net::IpAddr,
        mail_from: Option<&EmailAddress>,
        rcpt_to: &EmailAddress,
        received_at: DateTime<Utc>,
    ) -> Self {
        let (m1, m2, m3) = masked_ips(remote_ip);
        let mut msg = Message {
            received_at,
            remote_ip: remote_ip.to_string(),
            remote_ip_masked1: m1,
            remote_ip_masked2: m2,
            remote_ip_masked3: m3,
            rcpt_to_localpart: rcpt_to.localpart.to_lowercase(),
            rcpt_to_domain: rcpt_to.domain.clone(),
            ..Message::default()
        };
        if let Some(from) = mail_from {
            msg.mail_from_localpart = from.localpart.to_lowercase();
            msg.mail_from_domain = from.domain.clone();
        }
        msg
    }

    /// Record the parsed and authenticated From-header address.
    pub fn set_msg_from(&mut self, from: &EmailAddress, validation: FromValidation) {
        self.msg_from_localpart = from.localpart.to_lowercase();
        self.msg_from_domain = from.domain.clone();
        self.msg_from_org_domain = organizational_domain(&from.domain);
        self.msg_from_validation = validation.as_str().to_string();
        self.msg_from_validated = validation != FromValidation::None;
    }

    pub fn set_mail_from_validation(&mut self, validation: Validation) {
        self.mail_from_validation = validation.as_str().to_string();
        self.mail_from_validated = validation == Validation::Pass;
    }

    pub fn mail_from_validation(&self) -> Validation {
        Validation::from_str_opt(&self.mail_from_validation).unwrap_or_default()
    }

    pub fn msg_from_validation(&self) -> FromValidation {
        FromValidation::from_str_opt(&self.msg_from_validation).unwrap_or_default()
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags {
            seen: self.seen,
            answered: self.answered,
            flagged: self.flagged,
            deleted: self.deleted,
            draft: self.draft,
            junk: self.junk,
            notjunk: self.notjunk,
            forwarded: self.forwarded,
            phishing: self.phishing,
            mdnsent: self.mdnsent,
        }
    }

    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.seen = flags.seen;
        self.answered = flags.answered;
        self.flagged = flags.flagged;
        self.deleted = flags.deleted;
        self.draft = flags.draft;
        self.junk = flags.junk;
        self.notjunk = flags.notjunk;
        self.forwarded = flags.forwarded;
        self.phishing = flags.phishing;
        self.mdnsent = flags.mdnsent;
    }

    pub fn keywords_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.keywords).unwrap_or_default()
    }

    pub fn set_keywords(&mut self, keywords: &[String]) {
        let mut kw: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        kw.sort();
        kw.dedup();
        self.keywords = serde_json::to_string(&kw).unwrap_or_else(|_| "[]".to_string());
    }
}

/// A mailbox within an account.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: i64,
    /// Hierarchical name with "/" separator, unique per account.
    pub name: String,
    pub uid_validity: i64,
    pub uid_next: i64,
    pub special_use: Option<String>,
    /// Keywords clients stored in this mailbox, JSON-encoded list.
    pub keywords: String,
}

/// Outbound recipient history. Written when the account sends mail, read by
/// the analyzer to accept replies from known correspondents.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    pub message_id: i64,
    pub localpart: String,
    pub domain: String,
    pub org_domain: String,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_inbound_masks_ip() {
        let rcpt = EmailAddress::parse("mjl@example.com").unwrap();
        let msg = Message::new_inbound("10.20.30.40".parse().unwrap(), None, &rcpt, Utc::now());
        assert_eq!(msg.remote_ip_masked1, "10.20.30.40");
        assert_eq!(msg.remote_ip_masked2, "10.20.30.0");
        assert_eq!(msg.remote_ip_masked3, "10.20.0.0");
        assert_eq!(msg.rcpt_to_localpart, "mjl");
    }

    #[test]
    fn test_msg_from_org_domain() {
        let rcpt = EmailAddress::parse("mjl@example.com").unwrap();
        let mut msg = Message::new_inbound("10.0.0.1".parse().unwrap(), None, &rcpt, Utc::now());
        let from = EmailAddress::parse("sales@mail.shop.example.org").unwrap();
        msg.set_msg_from(&from, FromValidation::Dmarc);
        assert_eq!(msg.msg_from_org_domain, "example.org");
        assert!(msg.msg_from_validated);
    }

    #[test]
    fn test_keywords_roundtrip() {
        let mut msg = Message::default();
        msg.set_keywords(&["Work".to_string(), "work".to_string(), "travel".to_string()]);
        assert_eq!(msg.keywords_vec(), vec!["travel".to_string(), "work".to_string()]);
    }
}
