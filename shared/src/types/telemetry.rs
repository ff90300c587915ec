//! Telemetry data structures
//!
//! A [`TelemetryRecord`] is one completed speed test as reported by the
//! client. Measurements are kept exactly as submitted (text), and the `id`
//! and `timestamp` fields belong to whichever store persisted the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored in place of `isp_info` when the client sent none.
pub const EMPTY_ISP_INFO: &str = "{}";

/// One persisted speed test result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Store-assigned identifier (ULID text). Empty until inserted.
    pub id: String,

    /// Store-assigned insertion time
    pub timestamp: DateTime<Utc>,

    /// Originating client address, or the redaction sentinel
    pub ip_address: String,

    /// Raw ISP information JSON, stored verbatim
    pub isp_info: String,

    /// Free-form client metadata
    pub extra: String,

    pub user_agent: String,
    pub language: String,

    /// Download speed as submitted
    pub download: String,

    /// Upload speed as submitted
    pub upload: String,

    pub ping: String,
    pub jitter: String,

    /// Client-side diagnostic log
    pub log: String,
}

impl TelemetryRecord {
    /// Whether a store has assigned this record an identifier yet
    pub fn is_stamped(&self) -> bool {
        !self.id.is_empty()
    }

    /// Compare submitted content, ignoring the store-assigned `id` and `timestamp`.
    pub fn eq_ignoring_stamp(&self, other: &Self) -> bool {
        self.ip_address == other.ip_address
            && self.isp_info == other.isp_info
            && self.extra == other.extra
            && self.user_agent == other.user_agent
            && self.language == other.language
            && self.download == other.download
            && self.upload == other.upload
            && self.ping == other.ping
            && self.jitter == other.jitter
            && self.log == other.log
    }
}

/// Form fields posted to the telemetry endpoint.
///
/// Every field is optional on the wire and defaults to an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryForm {
    #[serde(rename = "ispinfo")]
    pub isp_info: String,
    #[serde(rename = "dl")]
    pub download: String,
    #[serde(rename = "ul")]
    pub upload: String,
    pub ping: String,
    pub jitter: String,
    pub log: String,
    pub extra: String,
}

impl TelemetryForm {
    /// Build an unstamped record from the form and request metadata.
    pub fn into_record(
        self,
        ip_address: String,
        user_agent: String,
        language: String,
    ) -> TelemetryRecord {
        let isp_info = if self.isp_info.is_empty() {
            EMPTY_ISP_INFO.to_string()
        } else {
            self.isp_info
        };

        TelemetryRecord {
            id: String::new(),
            timestamp: DateTime::<Utc>::default(),
            ip_address,
            isp_info,
            extra: self.extra,
            user_agent,
            language,
            download: self.download,
            upload: self.upload,
            ping: self.ping,
            jitter: self.jitter,
            log: self.log,
        }
    }
}
