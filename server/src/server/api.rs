//! Data-plane HTTP server for speed test clients.
//! Serves /empty, /garbage, /getIP, telemetry and result routes with CORS.

use super::results;
use crate::locator::ClientLocator;
use crate::metrics;
use crate::payload::{DownloadLimits, PayloadPool};
use crate::storage::TelemetryStore;
use bytes::{Bytes, BytesMut};
use hyper::body::HttpBody;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode, Uri};
use serde::de::value::MapDeserializer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use speedtest_shared::DistanceUnit;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Everything a request handler needs, shared by all connections
pub struct ApiState {
    pub payload: PayloadPool,
    pub locator: Arc<ClientLocator>,
    pub store: Arc<dyn TelemetryStore>,
    pub download: DownloadLimits,
    pub redact_ip: bool,
    pub stats_password: String,
}

/// Known data-plane routes. The `.php` forms are kept for older front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Empty,
    Garbage,
    GetIp,
    Telemetry,
    Results,
    Stats,
}

impl Route {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/empty" | "/empty.php" => Some(Route::Empty),
            "/garbage" | "/garbage.php" => Some(Route::Garbage),
            "/getIP" | "/getIP.php" => Some(Route::GetIp),
            "/results/telemetry" | "/results/telemetry.php" => Some(Route::Telemetry),
            "/results" | "/results/" => Some(Route::Results),
            "/stats" | "/stats.php" => Some(Route::Stats),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Route::Empty => "empty",
            Route::Garbage => "garbage",
            Route::GetIp => "getip",
            Route::Telemetry => "telemetry",
            Route::Results => "results",
            Route::Stats => "stats",
        }
    }

    fn allows(self, method: &Method) -> bool {
        match self {
            Route::Empty | Route::Stats => method == Method::GET || method == Method::POST,
            Route::Garbage | Route::GetIp | Route::Results => method == Method::GET,
            Route::Telemetry => method == Method::POST,
        }
    }
}

/// Serve the data plane on an already bound listener until `shutdown` fires.
pub async fn serve_api(
    listener: std::net::TcpListener,
    state: Arc<ApiState>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let peer = conn.remote_addr();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move { Ok::<_, hyper::Error>(handle(req, peer, &state).await) }
            }))
        }
    });

    Server::from_tcp(listener)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Route one request. Every response carries CORS and no-cache headers.
pub async fn handle(req: Request<Body>, peer: SocketAddr, state: &ApiState) -> Response<Body> {
    let route = Route::from_path(req.uri().path());
    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[route.map(Route::label).unwrap_or("unknown")])
        .inc();

    let response = match route {
        None => text_response(StatusCode::NOT_FOUND, "not found\n"),
        Some(_) if req.method() == Method::OPTIONS => cors_preflight(),
        Some(route) if !route.allows(req.method()) => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n")
        }
        Some(Route::Empty) => empty(req).await,
        Some(Route::Garbage) => garbage(&req, state),
        Some(Route::GetIp) => get_ip(&req, peer, state).await,
        Some(Route::Telemetry) => results::record(req, peer, state).await,
        Some(Route::Results) => results::fetch(&req, state).await,
        Some(Route::Stats) => results::stats(req, state).await,
    };
    add_common_headers(response)
}

/// Drain and discard the upload.
async fn empty(req: Request<Body>) -> Response<Body> {
    let mut body = req.into_body();
    let mut received = 0u64;
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(bytes) => received += bytes.len() as u64,
            Err(e) => {
                metrics::TRANSFERS_INTERRUPTED
                    .with_label_values(&["upload"])
                    .inc();
                tracing::debug!("Upload interrupted after {} bytes: {}", received, e);
                break;
            }
        }
    }
    metrics::UPLOAD_BYTES.inc_by(received as f64);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONNECTION, "keep-alive")
        .body(Body::empty())
        .expect("response build")
}

/// Stream the shared random block `ckSize` times.
fn garbage(req: &Request<Body>, state: &ApiState) -> Response<Body> {
    let ck_size = query_param(req.uri(), "ckSize");
    let chunks = state.download.chunk_count(ck_size.as_deref());

    let (sender, body) = Body::channel();
    let payload = state.payload.clone();
    tokio::spawn(async move {
        match payload.serve(chunks, sender).await {
            Ok(bytes) => tracing::debug!("Download finished: {} chunks, {} bytes", chunks, bytes),
            Err(e) => tracing::info!("Download {}", e),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Description", "File Transfer")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, "attachment; filename=random.dat")
        .header("Content-Transfer-Encoding", "binary")
        .body(body)
        .expect("response build")
}

async fn get_ip(req: &Request<Body>, peer: SocketAddr, state: &ApiState) -> Response<Body> {
    let ip = client_ip(req.headers(), peer);
    let with_isp = query_param(req.uri(), "isp").as_deref() == Some("true");
    let unit = query_param(req.uri(), "distance")
        .map(|u| DistanceUnit::from_query(&u))
        .unwrap_or_default();

    let described = state.locator.describe(&ip, with_isp, unit).await;
    json_response(StatusCode::OK, &described)
}

/// Address of the client: `X-Real-IP`, then the first `X-Forwarded-For`
/// entry, then the TCP peer. IPv4-mapped IPv6 addresses are shown as IPv4.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let raw = header_value("x-real-ip")
        .or_else(|| header_value("x-forwarded-for"))
        .unwrap_or_else(|| peer.ip().to_string());

    match raw.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => raw,
    }
}

/// First value of `name` in the URI query string.
pub(crate) fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    form_value(query.as_bytes(), name)
}

/// First value of `name` in a urlencoded byte string.
pub(crate) fn form_value(encoded: &[u8], name: &str) -> Option<String> {
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(encoded)
        .ok()?
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value)
}

#[derive(Debug, Error)]
pub(crate) enum FormError {
    #[error("malformed urlencoded body: {0}")]
    Encoding(#[source] serde_urlencoded::de::Error),

    #[error("invalid form fields: {0}")]
    Fields(#[source] serde::de::value::Error),
}

/// Decode a urlencoded body into `T`. A repeated field keeps its first value.
pub(crate) fn decode_form<T: DeserializeOwned>(encoded: &[u8]) -> Result<T, FormError> {
    let pairs = serde_urlencoded::from_bytes::<Vec<(String, String)>>(encoded)
        .map_err(FormError::Encoding)?;
    let mut fields: Vec<(String, String)> = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if !fields.iter().any(|(seen, _)| *seen == key) {
            fields.push((key, value));
        }
    }
    let map = MapDeserializer::<_, serde::de::value::Error>::new(fields.into_iter());
    T::deserialize(map).map_err(FormError::Fields)
}

#[derive(Debug, Error)]
pub(crate) enum BodyError {
    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("request body read failed: {0}")]
    Read(#[from] hyper::Error),
}

/// Collect a request body, refusing anything larger than `limit` bytes.
pub(crate) async fn read_body(mut body: Body, limit: usize) -> Result<Bytes, BodyError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body.into())
        .expect("response build")
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("response build"),
        Err(e) => {
            tracing::error!("Failed to encode response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
        }
    }
}

fn cors_preflight() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_MAX_AGE, "86400")
        .body(Body::empty())
        .expect("response build")
}

fn add_common_headers(mut res: Response<Body>) -> Response<Body> {
    let headers = res.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, no-transform, must-revalidate, private, max-age=0"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"),
    );
    res
}
