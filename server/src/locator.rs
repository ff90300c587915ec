//! Client address classification, ISP lookup and distance estimation
//!
//! Lookups against ipinfo.io are best-effort: any failure is logged and the
//! caller gets an empty [`IpInfo`], never an error.

use crate::config::LookupSettings;
use crate::metrics;
use once_cell::sync::Lazy;
use regex::Regex;
use speedtest_shared::{Coordinate, DistanceUnit, GetIpResponse, IpInfo};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// `AS<number> ` prefix ipinfo.io puts in front of organization names.
static AS_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"AS\d+\s").expect("valid regex"));

const UNKNOWN_ISP: &str = "Unknown ISP";

/// Special-use address ranges that never warrant an external lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    LoopbackV6,
    LinkLocalV6,
    LoopbackV4,
    PrivateV4,
    LinkLocalV4,
    CgnatV4,
    /// Publicly routable, or not an address at all
    None,
}

impl AddressClass {
    /// Short label used in logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            AddressClass::LoopbackV6 | AddressClass::LoopbackV4 => "loopback",
            AddressClass::LinkLocalV6 | AddressClass::LinkLocalV4 => "link-local",
            AddressClass::PrivateV4 => "private",
            AddressClass::CgnatV4 => "cgnat",
            AddressClass::None => "none",
        }
    }

    /// Text shown to the client in place of ISP details.
    pub fn description(self) -> Option<&'static str> {
        match self {
            AddressClass::LoopbackV6 => Some("localhost IPv6 access"),
            AddressClass::LinkLocalV6 => Some("link-local IPv6 access"),
            AddressClass::LoopbackV4 => Some("localhost IPv4 access"),
            AddressClass::PrivateV4 => Some("private IPv4 access"),
            AddressClass::LinkLocalV4 => Some("link-local IPv4 access"),
            AddressClass::CgnatV4 => Some("CGNAT IPv4 access"),
            AddressClass::None => None,
        }
    }

    pub fn is_special(self) -> bool {
        self != AddressClass::None
    }
}

/// Classify an address string. Unparseable input is `None`.
pub fn classify(addr: &str) -> AddressClass {
    match addr.trim().parse::<IpAddr>() {
        Ok(ip) => classify_ip(ip),
        Err(_) => AddressClass::None,
    }
}

pub fn classify_ip(ip: IpAddr) -> AddressClass {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => classify_v4(v4),
            None => classify_v6(v6),
        },
    }
}

fn classify_v4(ip: Ipv4Addr) -> AddressClass {
    let [a, b, ..] = ip.octets();
    if ip.is_loopback() {
        AddressClass::LoopbackV4
    } else if ip.is_private() {
        AddressClass::PrivateV4
    } else if ip.is_link_local() {
        AddressClass::LinkLocalV4
    } else if a == 100 && (64..128).contains(&b) {
        AddressClass::CgnatV4
    } else {
        AddressClass::None
    }
}

fn classify_v6(ip: Ipv6Addr) -> AddressClass {
    if ip.is_loopback() {
        AddressClass::LoopbackV6
    } else if ip.segments()[0] & 0xffc0 == 0xfe80 {
        AddressClass::LinkLocalV6
    } else {
        AddressClass::None
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("lookup returned HTTP {0}")]
    Status(u16),
}

/// Thin client for the ipinfo.io JSON API
#[derive(Debug, Clone)]
pub struct IpInfoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl IpInfoClient {
    pub fn new(settings: &LookupSettings) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .user_agent(concat!("speedtest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    fn url_for(&self, addr: Option<&str>) -> String {
        match addr {
            Some(addr) => format!("{}/{}/json", self.base_url, addr),
            None => format!("{}/json", self.base_url),
        }
    }

    /// Look up `addr`, or the caller's own public address when `None`.
    pub async fn lookup(&self, addr: Option<&str>) -> Result<IpInfo, LookupError> {
        let mut request = self.http.get(self.url_for(addr));
        if let Some(key) = &self.api_key {
            request = request.query(&[("token", key)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(LookupError::Status(response.status().as_u16()));
        }
        Ok(response.json::<IpInfo>().await?)
    }
}

/// Geographic position of this server, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerLocation(pub Coordinate);

impl ServerLocation {
    pub const fn fixed(latitude: f64, longitude: f64) -> Self {
        Self(Coordinate::new(latitude, longitude))
    }

    /// Use the configured coordinates when both are set, otherwise ask the
    /// lookup service where this host is. Falls back to `(0, 0)`.
    pub async fn resolve(client: &IpInfoClient, latitude: f64, longitude: f64) -> Self {
        if latitude != 0.0 && longitude != 0.0 {
            tracing::info!("Configured server coordinates: {:.6}, {:.6}", latitude, longitude);
            return Self::fixed(latitude, longitude);
        }

        let info = match client.lookup(None).await {
            Ok(info) => info,
            Err(e) => {
                tracing::error!("Cannot determine server location: {}", e);
                return Self::fixed(0.0, 0.0);
            }
        };

        match info.loc.parse::<Coordinate>() {
            Ok(coord) => {
                tracing::info!("Fetched server coordinates: {}", coord);
                Self(coord)
            }
            Err(e) => {
                tracing::error!("Unusable server location {:?}: {}", info.loc, e);
                Self::fixed(0.0, 0.0)
            }
        }
    }
}

/// Answers "who and where is this client" for the address endpoint
#[derive(Debug, Clone)]
pub struct ClientLocator {
    lookup: IpInfoClient,
    server: ServerLocation,
}

impl ClientLocator {
    pub fn new(lookup: IpInfoClient, server: ServerLocation) -> Self {
        Self { lookup, server }
    }

    pub fn server_location(&self) -> ServerLocation {
        self.server
    }

    /// ISP and location details for `addr`; empty on any failure.
    pub async fn locate(&self, addr: &str) -> IpInfo {
        match self.lookup.lookup(Some(addr)).await {
            Ok(info) => {
                metrics::IP_LOOKUPS_TOTAL.with_label_values(&["ok"]).inc();
                info
            }
            Err(e) => {
                metrics::IP_LOOKUPS_TOTAL.with_label_values(&["error"]).inc();
                tracing::warn!("IP lookup for {} failed: {}", addr, e);
                IpInfo::default()
            }
        }
    }

    /// Great-circle distance from this server to a `"lat,lon"` location.
    pub fn distance(&self, client_location: &str, unit: DistanceUnit) -> Option<f64> {
        match client_location.parse::<Coordinate>() {
            Ok(client) => Some(self.server.0.distance_to(&client, unit)),
            Err(e) => {
                tracing::warn!("Ignoring client location {:?}: {}", client_location, e);
                None
            }
        }
    }

    /// Display form of [`Self::distance`]; empty when it cannot be computed.
    pub fn distance_label(&self, client_location: &str, unit: DistanceUnit) -> String {
        self.distance(client_location, unit)
            .map(|d| unit.label(d))
            .unwrap_or_default()
    }

    /// Build the address endpoint response for `addr`.
    pub async fn describe(&self, addr: &str, with_isp: bool, unit: DistanceUnit) -> GetIpResponse {
        if let Some(text) = classify(addr).description() {
            return GetIpResponse {
                processed_string: format!("{} - {}", addr, text),
                raw_isp_info: IpInfo::default(),
            };
        }

        if !with_isp {
            return GetIpResponse {
                processed_string: addr.to_string(),
                raw_isp_info: IpInfo::default(),
            };
        }

        let info = self.locate(addr).await;
        let processed_string = format!("{} - {}", addr, self.isp_summary(&info, unit));
        GetIpResponse {
            processed_string,
            raw_isp_info: info,
        }
    }

    /// `"<isp>[, <country>][ (<distance>)]"`
    fn isp_summary(&self, info: &IpInfo, unit: DistanceUnit) -> String {
        let mut isp = AS_PREFIX.replace_all(&info.org, "").trim().to_string();
        if isp.is_empty() {
            isp = UNKNOWN_ISP.to_string();
        }
        if !info.country.is_empty() {
            isp.push_str(", ");
            isp.push_str(&info.country);
        }
        if !info.loc.is_empty() {
            let label = self.distance_label(&info.loc, unit);
            if !label.is_empty() {
                isp.push_str(&format!(" ({})", label));
            }
        }
        isp
    }
}
