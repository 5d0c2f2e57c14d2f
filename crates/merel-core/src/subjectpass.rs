//! Subjectpass: an HMAC-keyed token challenge for unknown senders.
//!
//! When the analysis would reject a borderline message from a sender
//! without history, the SMTP reject text carries a freshly generated
//! token. A legitimate sender (or their human) retries with the token in
//! the Subject, which the next analysis pass verifies and accepts.
//!
//! A token is `(pass:<base32>)` over an 8-byte big-endian unix timestamp
//! followed by a 12-byte truncated HMAC-SHA256 of the sender address and
//! that timestamp.

use chrono::{DateTime, Duration, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use mail_parser::{HeaderName, MessageParser};
use merel_common::types::EmailAddress;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Reject-text prefix ahead of a generated token.
pub const EXPLANATION: &str =
    "you are not a known sender; to get your message delivered, send it again with the following token added to the subject line: ";

/// Truncated MAC length inside a token.
const MAC_LEN: usize = 12;

/// Allowed clock skew for tokens from the future.
const FUTURE_SKEW: i64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("message has no From address")]
    NoFrom,
    #[error("no subjectpass token in message")]
    NoToken,
    #[error("token expired")]
    Expired,
    #[error("token does not verify")]
    BadToken,
}

/// Generate a token for a sender address at the given time.
pub fn generate(from: &EmailAddress, key: &[u8], now: DateTime<Utc>) -> String {
    let ts = now.timestamp();
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(from.canonical().as_bytes());
    mac.update(&ts.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let mut token = Vec::with_capacity(8 + MAC_LEN);
    token.extend_from_slice(&ts.to_be_bytes());
    token.extend_from_slice(&digest[..MAC_LEN]);
    format!("(pass:{})", BASE32_NOPAD.encode(&token))
}

/// Verify a message that may carry a token in its Subject. The token must
/// MAC-match the From address and be at most `period` old.
pub fn verify(
    data: &[u8],
    key: &[u8],
    period: Duration,
    now: DateTime<Utc>,
) -> Result<(), VerifyError> {
    let parsed = MessageParser::default().parse(data).ok_or(VerifyError::NoFrom)?;
    let from = parsed
        .header(HeaderName::From)
        .and_then(|v| v.as_address())
        .and_then(|a| a.as_list())
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .and_then(EmailAddress::parse)
        .ok_or(VerifyError::NoFrom)?;
    let subject = parsed
        .header(HeaderName::Subject)
        .and_then(|v| v.as_text())
        .ok_or(VerifyError::NoToken)?;

    let mut last_err = VerifyError::NoToken;
    for candidate in tokens_in(subject) {
        match verify_token(&candidate, &from, key, period, now) {
            Ok(()) => {
                debug!(%from, "valid subjectpass token");
                return Ok(());
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn verify_token(
    token: &str,
    from: &EmailAddress,
    key: &[u8],
    period: Duration,
    now: DateTime<Utc>,
) -> Result<(), VerifyError> {
    let raw = BASE32_NOPAD
        .decode(token.as_bytes())
        .map_err(|_| VerifyError::BadToken)?;
    if raw.len() != 8 + MAC_LEN {
        return Err(VerifyError::BadToken);
    }
    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&raw[..8]);
    let ts = i64::from_be_bytes(ts_bytes);

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(from.canonical().as_bytes());
    mac.update(&ts_bytes);
    mac.verify_truncated_left(&raw[8..])
        .map_err(|_| VerifyError::BadToken)?;

    let age = now.timestamp() - ts;
    if age > period.num_seconds() || age < -FUTURE_SKEW {
        return Err(VerifyError::Expired);
    }
    Ok(())
}

/// Candidate base32 tokens following a "pass:" marker.
fn tokens_in(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("pass:") {
        rest = &rest[pos + 5..];
        let token: String = rest
            .chars()
            .take_while(|c| c.is_ascii_uppercase() || ('2'..='7').contains(c))
            .collect();
        if !token.is_empty() {
            tokens.push(token);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: &str, subject: &str) -> Vec<u8> {
        format!("From: <{}>\r\nSubject: {}\r\n\r\nbody\r\n", from, subject).into_bytes()
    }

    #[test]
    fn test_roundtrip() {
        let from = EmailAddress::parse("remote@example.org").unwrap();
        let key = b"0123456789abcdef";
        let t0 = Utc::now();

        let token = generate(&from, key, t0);
        assert!(token.starts_with("(pass:"));

        let data = message("remote@example.org", &format!("hello {}", token));
        assert_eq!(verify(&data, key, Duration::hours(1), t0), Ok(()));

        // Still valid just inside the period.
        assert_eq!(
            verify(&data, key, Duration::hours(1), t0 + Duration::minutes(59)),
            Ok(())
        );

        // Expired outside the period.
        assert_eq!(
            verify(&data, key, Duration::hours(1), t0 + Duration::minutes(61)),
            Err(VerifyError::Expired)
        );
    }

    #[test]
    fn test_token_bound_to_sender() {
        let from = EmailAddress::parse("remote@example.org").unwrap();
        let key = b"0123456789abcdef";
        let t0 = Utc::now();
        let token = generate(&from, key, t0);

        let data = message("other@example.org", &format!("hi {}", token));
        assert_eq!(
            verify(&data, key, Duration::hours(1), t0),
            Err(VerifyError::BadToken)
        );
    }

    #[test]
    fn test_token_bound_to_key() {
        let from = EmailAddress::parse("remote@example.org").unwrap();
        let t0 = Utc::now();
        let token = generate(&from, b"key-one", t0);

        let data = message("remote@example.org", &format!("hi {}", token));
        assert_eq!(
            verify(&data, b"key-two", Duration::hours(1), t0),
            Err(VerifyError::BadToken)
        );
    }

    #[test]
    fn test_no_token() {
        let data = message("remote@example.org", "plain subject");
        assert_eq!(
            verify(&data, b"key", Duration::hours(1), Utc::now()),
            Err(VerifyError::NoToken)
        );
    }

    #[test]
    fn test_token_extraction_from_reject_text() {
        let from = EmailAddress::parse("remote@example.org").unwrap();
        let key = b"secret";
        let t0 = Utc::now();
        let explanation = format!("{}{}", EXPLANATION, generate(&from, key, t0));

        // A sender pasting the whole explanation into the subject works too.
        let data = message("remote@example.org", &explanation);
        assert_eq!(verify(&data, key, Duration::hours(1), t0), Ok(()));
    }
}
