//! TLS-RPT (RFC 8460) report parsing.
//!
//! SMTP TLS reports arrive as JSON, either as the message body or as an
//! `application/tlsrpt+json` attachment. The analysis validates the
//! DKIM gate before calling in here; this module only extracts and
//! deserializes.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

/// An RFC 8460 tlsrpt report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Report {
    pub organization_name: String,
    pub date_range: DateRange,
    #[serde(default)]
    pub contact_info: Option<String>,
    pub report_id: String,
    pub policies: Vec<PolicyResult>,
}

impl Report {
    /// Domains this report is about.
    pub fn policy_domains(&self) -> Vec<&str> {
        self.policies
            .iter()
            .map(|p| p.policy.policy_domain.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DateRange {
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyResult {
    pub policy: Policy,
    pub summary: Summary,
    #[serde(default)]
    pub failure_details: Vec<FailureDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Policy {
    pub policy_type: String,
    #[serde(default)]
    pub policy_string: Vec<String>,
    pub policy_domain: String,
    #[serde(default)]
    pub mx_host: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Summary {
    #[serde(default)]
    pub total_successful_session_count: i64,
    #[serde(default)]
    pub total_failure_session_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailureDetails {
    pub result_type: String,
    #[serde(default)]
    pub sending_mta_ip: Option<String>,
    #[serde(default)]
    pub receiving_mx_hostname: Option<String>,
    #[serde(default)]
    pub failed_session_count: i64,
}

/// Parse a bare JSON report.
pub fn parse(data: &[u8]) -> Result<Report> {
    serde_json::from_slice(data).map_err(|e| anyhow!("parsing tlsrpt json: {}", e))
}

/// Find and parse the report inside a message.
pub fn parse_message(data: &[u8]) -> Result<Report> {
    let parsed = MessageParser::default()
        .parse(data)
        .ok_or_else(|| anyhow!("unparseable message"))?;

    for part in &parsed.parts {
        let is_report = part.content_type().is_some_and(|ct| {
            ct.ctype().eq_ignore_ascii_case("application")
                && ct
                    .subtype()
                    .is_some_and(|s| s.eq_ignore_ascii_case("tlsrpt+json") || s.eq_ignore_ascii_case("json"))
        });
        if is_report {
            return parse(part.contents());
        }
    }

    // Some reporters send the JSON as a plain text body.
    if let Some(text) = parsed.body_text(0) {
        if let Ok(report) = parse(text.as_bytes()) {
            return Ok(report);
        }
    }
    Err(anyhow!("no tlsrpt report part in message"))
}

#[cfg(test)]
pub(crate) const SAMPLE_REPORT: &str = r#"{
  "organization-name": "Reporter Inc",
  "date-range": {
    "start-datetime": "2023-01-01T00:00:00Z",
    "end-datetime": "2023-01-02T00:00:00Z"
  },
  "report-id": "2023-01-01/merel.example",
  "policies": [{
    "policy": {
      "policy-type": "sts",
      "policy-string": ["version: STSv1", "mode: enforce"],
      "policy-domain": "merel.example"
    },
    "summary": {
      "total-successful-session-count": 100,
      "total-failure-session-count": 2
    },
    "failure-details": [{
      "result-type": "starttls-not-supported",
      "sending-mta-ip": "192.0.2.1",
      "failed-session-count": 2
    }]
  }]
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let report = parse(SAMPLE_REPORT.as_bytes()).unwrap();
        assert_eq!(report.organization_name, "Reporter Inc");
        assert_eq!(report.policy_domains(), vec!["merel.example"]);
        assert_eq!(report.policies[0].summary.total_failure_session_count, 2);
        assert_eq!(
            report.policies[0].failure_details[0].result_type,
            "starttls-not-supported"
        );
    }

    #[test]
    fn test_parse_message_with_json_part() {
        let message = format!(
            "From: reporter@reporter.example\r\nTo: tlsrpt@merel.example\r\nSubject: report\r\nContent-Type: application/tlsrpt+json\r\n\r\n{}",
            SAMPLE_REPORT
        );
        let report = parse_message(message.as_bytes()).unwrap();
        assert_eq!(report.report_id, "2023-01-01/merel.example");
    }

    #[test]
    fn test_parse_message_without_report() {
        let message = b"From: a@b.example\r\nSubject: hi\r\n\r\njust text\r\n";
        assert!(parse_message(message).is_err());
    }
}
