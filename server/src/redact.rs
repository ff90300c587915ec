//! Address redaction for stored telemetry
//!
//! Replaces IPv4/IPv6 literals with `0.0.0.0` and any JSON `"hostname"`
//! member with a fixed placeholder. Candidates are only replaced when they
//! parse as real addresses, so clock times like `12:30:45` survive.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use speedtest_shared::TelemetryRecord;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Replacement for any address literal.
pub const REDACTED_ADDRESS: &str = "0.0.0.0";

const REDACTED_HOSTNAME: &str = r#""hostname":"REDACTED""#;

static IPV6_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9A-Fa-f.:]*:[0-9A-Fa-f.:]*").expect("valid regex"));

static IPV4_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("valid regex"));

static HOSTNAME_MEMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""hostname"\s*:\s*"(?:[^"\\]|\\.)*""#).expect("valid regex"));

/// Redact every address and hostname in `text`.
pub fn redact_text(text: &str) -> String {
    let text = IPV6_CANDIDATE.replace_all(text, |caps: &Captures| {
        let candidate = &caps[0];
        match ipv6_prefix_len(candidate) {
            Some(len) => format!("{}{}", REDACTED_ADDRESS, &candidate[len..]),
            None => candidate.to_string(),
        }
    });

    let text = IPV4_CANDIDATE.replace_all(&text, |caps: &Captures| {
        let candidate = &caps[0];
        if candidate.parse::<Ipv4Addr>().is_ok() {
            REDACTED_ADDRESS.to_string()
        } else {
            candidate.to_string()
        }
    });

    HOSTNAME_MEMBER
        .replace_all(&text, REDACTED_HOSTNAME)
        .into_owned()
}

/// Length of the longest prefix of `candidate` that is an IPv6 address,
/// dropping trailing `.`/`:` punctuation one character at a time.
fn ipv6_prefix_len(candidate: &str) -> Option<usize> {
    let mut end = candidate.len();
    loop {
        let prefix = &candidate[..end];
        if prefix.parse::<Ipv6Addr>().is_ok() {
            return Some(end);
        }
        if !(prefix.ends_with('.') || prefix.ends_with(':')) {
            return None;
        }
        end -= 1;
    }
}

/// Strip client identifying data from a record before it is stored.
pub fn redact_record(record: &mut TelemetryRecord) {
    record.ip_address = REDACTED_ADDRESS.to_string();
    record.isp_info = redact_text(&record.isp_info);
    record.log = redact_text(&record.log);
}
