//! IP lookup wire types
//!
//! [`IpInfo`] mirrors the JSON document returned by ipinfo.io; every field is
//! optional there, so each one defaults to an empty string here.

use serde::{Deserialize, Serialize};

/// Organization and location metadata for one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpInfo {
    pub ip: String,
    pub hostname: String,
    pub city: String,
    pub region: String,
    pub country: String,
    /// `"lat,lon"` string
    pub loc: String,
    /// Organization, usually prefixed with the AS number
    pub org: String,
    pub postal: String,
    pub timezone: String,
    pub readme: String,
}

impl IpInfo {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Response body of the client address endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetIpResponse {
    #[serde(rename = "processedString")]
    pub processed_string: String,
    #[serde(rename = "rawIspInfo")]
    pub raw_isp_info: IpInfo,
}
