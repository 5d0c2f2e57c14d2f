//! DMARC aggregate report (RFC 7489 appendix C) parsing.
//!
//! Aggregate reports are XML documents delivered over SMTP. The parser is
//! an event walk with a tag-path stack; reports are accepted as plain XML
//! bodies or attachments (compressed containers are not unpacked).

use anyhow::{anyhow, Result};
use mail_parser::{MessageParser, MimeHeaders};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

/// The feedback element of an aggregate report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Feedback {
    pub report_metadata: ReportMetadata,
    pub policy_published: PolicyPublished,
    pub records: Vec<ReportRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub org_name: String,
    pub email: String,
    pub report_id: String,
    pub date_range: DateRange,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DateRange {
    /// Unix timestamps.
    pub begin: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyPublished {
    pub domain: String,
    pub adkim: String,
    pub aspf: String,
    pub p: String,
    pub sp: String,
    pub pct: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportRecord {
    pub source_ip: String,
    pub count: i64,
    pub disposition: String,
    pub dkim: String,
    pub spf: String,
    pub header_from: String,
}

/// Parse an aggregate report XML document.
pub fn parse(xml: &[u8]) -> Result<Feedback> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut feedback = Feedback::default();
    let mut current: Option<ReportRecord> = None;
    let mut seen_feedback = false;

    // Element path as a stack of tag names.
    let mut path: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "feedback" {
                    seen_feedback = true;
                }
                if tag == "record" {
                    current = Some(ReportRecord::default());
                }
                path.push(tag);
            }
            Ok(Event::End(_)) => {
                if path.last().is_some_and(|t| t == "record") {
                    if let Some(record) = current.take() {
                        feedback.records.push(record);
                    }
                }
                path.pop();
            }
            Ok(Event::Text(e)) => {
                let value = e.unescape().unwrap_or_default().to_string();
                apply_text(&mut feedback, &mut current, &path, &value);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(anyhow!("parsing report xml: {}", e)),
        }
        buf.clear();
    }

    if !seen_feedback {
        return Err(anyhow!("not a dmarc aggregate report"));
    }
    Ok(feedback)
}

fn apply_text(
    feedback: &mut Feedback,
    current: &mut Option<ReportRecord>,
    path: &[String],
    value: &str,
) {
    let joined = path.join("/");
    match joined.as_str() {
        "feedback/report_metadata/org_name" => feedback.report_metadata.org_name = value.to_string(),
        "feedback/report_metadata/email" => feedback.report_metadata.email = value.to_string(),
        "feedback/report_metadata/report_id" => {
            feedback.report_metadata.report_id = value.to_string()
        }
        "feedback/report_metadata/date_range/begin" => {
            feedback.report_metadata.date_range.begin = value.parse().unwrap_or(0)
        }
        "feedback/report_metadata/date_range/end" => {
            feedback.report_metadata.date_range.end = value.parse().unwrap_or(0)
        }
        "feedback/policy_published/domain" => feedback.policy_published.domain = value.to_lowercase(),
        "feedback/policy_published/adkim" => feedback.policy_published.adkim = value.to_string(),
        "feedback/policy_published/aspf" => feedback.policy_published.aspf = value.to_string(),
        "feedback/policy_published/p" => feedback.policy_published.p = value.to_string(),
        "feedback/policy_published/sp" => feedback.policy_published.sp = value.to_string(),
        "feedback/policy_published/pct" => {
            feedback.policy_published.pct = value.parse().unwrap_or(100)
        }
        _ => {
            if let Some(record) = current {
                match joined.as_str() {
                    "feedback/record/row/source_ip" => record.source_ip = value.to_string(),
                    "feedback/record/row/count" => record.count = value.parse().unwrap_or(0),
                    "feedback/record/row/policy_evaluated/disposition" => {
                        record.disposition = value.to_string()
                    }
                    "feedback/record/row/policy_evaluated/dkim" => record.dkim = value.to_string(),
                    "feedback/record/row/policy_evaluated/spf" => record.spf = value.to_string(),
                    "feedback/record/identifiers/header_from" => {
                        record.header_from = value.to_lowercase()
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Find and parse the report inside a message.
pub fn parse_message(data: &[u8]) -> Result<Feedback> {
    let parsed = MessageParser::default()
        .parse(data)
        .ok_or_else(|| anyhow!("unparseable message"))?;

    for part in &parsed.parts {
        let is_xml = part.content_type().is_some_and(|ct| {
            let main = ct.ctype();
            let sub = ct.subtype().unwrap_or("");
            (main.eq_ignore_ascii_case("application") || main.eq_ignore_ascii_case("text"))
                && sub.to_ascii_lowercase().contains("xml")
        });
        if is_xml {
            return parse(part.contents());
        }
    }

    if let Some(text) = parsed.body_text(0) {
        if text.contains("<feedback") {
            return parse(text.as_bytes());
        }
    }
    Err(anyhow!("no aggregate report part in message"))
}

#[cfg(test)]
pub(crate) fn sample_report(domain: &str, end: i64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feedback>
  <report_metadata>
    <org_name>Reporter Inc</org_name>
    <email>noreply@reporter.example</email>
    <report_id>1234567890</report_id>
    <date_range><begin>{}</begin><end>{}</end></date_range>
  </report_metadata>
  <policy_published>
    <domain>{}</domain>
    <adkim>r</adkim>
    <aspf>r</aspf>
    <p>reject</p>
    <sp>reject</sp>
    <pct>100</pct>
  </policy_published>
  <record>
    <row>
      <source_ip>192.0.2.1</source_ip>
      <count>3</count>
      <policy_evaluated>
        <disposition>none</disposition>
        <dkim>pass</dkim>
        <spf>pass</spf>
      </policy_evaluated>
    </row>
    <identifiers><header_from>{}</header_from></identifiers>
  </record>
</feedback>"#,
        end - 86400,
        end,
        domain,
        domain
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let xml = sample_report("merel.example", 1700000000);
        let feedback = parse(xml.as_bytes()).unwrap();
        assert_eq!(feedback.report_metadata.org_name, "Reporter Inc");
        assert_eq!(feedback.report_metadata.date_range.end, 1700000000);
        assert_eq!(feedback.policy_published.domain, "merel.example");
        assert_eq!(feedback.records.len(), 1);
        assert_eq!(feedback.records[0].count, 3);
        assert_eq!(feedback.records[0].dkim, "pass");
        assert_eq!(feedback.records[0].header_from, "merel.example");
    }

    #[test]
    fn test_parse_rejects_non_report() {
        assert!(parse(b"<html><body>hi</body></html>").is_err());
    }

    #[test]
    fn test_parse_message_with_xml_part() {
        let xml = sample_report("merel.example", 1700000000);
        let message = format!(
            "From: noreply@reporter.example\r\nSubject: Report\r\nContent-Type: application/xml\r\n\r\n{}",
            xml
        );
        let feedback = parse_message(message.as_bytes()).unwrap();
        assert_eq!(feedback.policy_published.domain, "merel.example");
    }
}
