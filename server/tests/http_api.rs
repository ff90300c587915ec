//! HTTP data plane tests: real listener, real handlers, in-process stores.
//!
//! The IP lookup service points at a closed local port, so lookups always
//! fail fast and exercise the degraded path.

use async_trait::async_trait;
use hyper::header;
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use speedtest_server::config::{LookupSettings, DEFAULT_STATS_PASSWORD};
use speedtest_server::locator::{ClientLocator, IpInfoClient, ServerLocation};
use speedtest_server::payload::{DownloadLimits, PayloadPool};
use speedtest_server::server::{serve_api, ApiState};
use speedtest_server::storage::memory::MemoryStore;
use speedtest_server::storage::null::NullStore;
use speedtest_server::storage::{StoreError, TelemetryStore};
use speedtest_shared::TelemetryRecord;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CHUNK: usize = 1024;

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn send(&self, req: Request<Body>) -> Response<Body> {
        Client::new().request(req).await.unwrap()
    }

    async fn get(&self, path: &str) -> Response<Body> {
        let req = Request::get(self.url(path)).body(Body::empty()).unwrap();
        self.send(req).await
    }

    async fn post_form(&self, path: &str, form: &str) -> Response<Body> {
        let req = Request::post(self.url(path))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::USER_AGENT, "speedtest-it/1.0")
            .header(header::ACCEPT_LANGUAGE, "en-GB")
            .body(Body::from(form.to_string()))
            .unwrap();
        self.send(req).await
    }
}

/// Store whose every operation fails, as a lost database connection would.
struct FailingStore;

#[async_trait]
impl TelemetryStore for FailingStore {
    async fn insert(&self, _record: TelemetryRecord) -> Result<String, StoreError> {
        Err(StoreError::Storage("connection refused".to_string()))
    }

    async fn fetch_by_id(&self, _id: &str) -> Result<TelemetryRecord, StoreError> {
        Err(StoreError::Storage("connection refused".to_string()))
    }

    async fn fetch_recent(&self, _limit: usize) -> Result<Vec<TelemetryRecord>, StoreError> {
        Err(StoreError::Storage("connection refused".to_string()))
    }

    fn backend(&self) -> &'static str {
        "failing"
    }
}

struct Options {
    store: Arc<dyn TelemetryStore>,
    redact_ip: bool,
    stats_password: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            redact_ip: false,
            stats_password: "s3cret".to_string(),
        }
    }
}

fn start(options: Options) -> TestServer {
    let lookup = IpInfoClient::new(&LookupSettings {
        base_url: "http://127.0.0.1:9".to_string(),
        api_key: None,
        timeout: Duration::from_secs(1),
    })
    .unwrap();

    let state = Arc::new(ApiState {
        payload: PayloadPool::generate(CHUNK).unwrap(),
        locator: Arc::new(ClientLocator::new(
            lookup,
            ServerLocation::fixed(48.8566, 2.3522),
        )),
        store: options.store,
        download: DownloadLimits::default(),
        redact_ip: options.redact_ip,
        stats_password: options.stats_password,
    });

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_api(listener, state, shutdown.clone()));

    TestServer { addr, shutdown }
}

async fn body_string(res: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn submit(server: &TestServer, form: &str) -> String {
    let res = server.post_form("/results/telemetry", form).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_string(res).await;
    body.strip_prefix("id ").expect("id response").to_string()
}

#[tokio::test]
async fn empty_discards_upload() {
    let server = start(Options::default());
    let req = Request::post(server.url("/empty"))
        .body(Body::from(vec![0u8; 256 * 1024]))
        .unwrap();
    let res = server.send(req).await;

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONNECTION], "keep-alive");
    assert_eq!(res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(body_string(res).await.is_empty());

    let res = server.get("/empty.php").await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn garbage_is_clamped_to_max_chunks() {
    let server = start(Options::default());
    let res = server.get("/garbage?ckSize=5000").await;

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "application/octet-stream");
    assert_eq!(
        res.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=random.dat"
    );
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    assert_eq!(body.len(), 1024 * CHUNK);
}

#[tokio::test]
async fn garbage_invalid_size_uses_default() {
    let server = start(Options::default());
    let body = hyper::body::to_bytes(server.get("/garbage.php?ckSize=lots").await.into_body())
        .await
        .unwrap();
    assert_eq!(body.len(), 4 * CHUNK);

    let body = hyper::body::to_bytes(server.get("/garbage?ckSize=2").await.into_body())
        .await
        .unwrap();
    assert_eq!(body.len(), 2 * CHUNK);
}

#[tokio::test]
async fn telemetry_round_trip() {
    let server = start(Options::default());
    let id = submit(
        &server,
        "ispinfo=&dl=93.12&ul=41.7&ping=12.00&jitter=1.34&log=all+good&extra=kiosk-3",
    )
    .await;
    assert_eq!(id.len(), 26);

    let res = server.get(&format!("/results?id={}", id)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let record: TelemetryRecord = serde_json::from_str(&body_string(res).await).unwrap();

    assert_eq!(record.id, id);
    assert_eq!(record.ip_address, "127.0.0.1");
    assert_eq!(record.isp_info, "{}");
    assert_eq!(record.download, "93.12");
    assert_eq!(record.log, "all good");
    assert_eq!(record.extra, "kiosk-3");
    assert_eq!(record.user_agent, "speedtest-it/1.0");
    assert_eq!(record.language, "en-GB");
}

#[tokio::test]
async fn unknown_result_is_404() {
    let server = start(Options::default());
    let res = server.get("/results?id=01ARZ3NDEKTSV4RRFFQ69G5FAV").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = server.get("/results").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn repeated_form_field_keeps_first_value() {
    let server = start(Options::default());
    let id = submit(&server, "dl=1&dl=2&ul=3").await;

    let res = server.get(&format!("/results?id={}", id)).await;
    let record: TelemetryRecord = serde_json::from_str(&body_string(res).await).unwrap();
    assert_eq!(record.download, "1");
    assert_eq!(record.upload, "3");
}

#[tokio::test]
async fn storage_failure_is_500() {
    let server = start(Options {
        store: Arc::new(FailingStore),
        ..Default::default()
    });

    let res = server.post_form("/results/telemetry", "dl=1&ul=2").await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body_string(res).await.starts_with("id "));

    let res = server.get("/results?id=01ARZ3NDEKTSV4RRFFQ69G5FAV").await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let req = Request::get(server.url("/stats?id=L100"))
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        server.send(req).await.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn telemetry_is_redacted_when_enabled() {
    let server = start(Options {
        redact_ip: true,
        ..Default::default()
    });

    let req = Request::post(server.url("/results/telemetry.php"))
        .header("X-Forwarded-For", "198.51.100.7")
        .body(Body::from(
            "ispinfo=%7B%22hostname%22%3A%22h7.example.net%22%7D&log=from+198.51.100.7&dl=10",
        ))
        .unwrap();
    let res = server.send(req).await;
    assert_eq!(res.status(), StatusCode::OK);
    let id = body_string(res).await.trim_start_matches("id ").to_string();

    let res = server.get(&format!("/results?id={}", id)).await;
    let record: TelemetryRecord = serde_json::from_str(&body_string(res).await).unwrap();
    assert_eq!(record.ip_address, "0.0.0.0");
    assert_eq!(record.isp_info, r#"{"hostname":"REDACTED"}"#);
    assert_eq!(record.log, "from 0.0.0.0");
    assert_eq!(record.download, "10");
}

#[tokio::test]
async fn get_ip_classifies_loopback() {
    let server = start(Options::default());
    let res = server.get("/getIP?isp=true").await;
    assert_eq!(res.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
    assert_eq!(json["processedString"], "127.0.0.1 - localhost IPv4 access");
    assert_eq!(json["rawIspInfo"]["org"], "");
}

#[tokio::test]
async fn get_ip_degrades_when_lookup_fails() {
    let server = start(Options::default());
    let req = Request::get(server.url("/getIP?isp=true&distance=km"))
        .header("X-Forwarded-For", "8.8.8.8")
        .body(Body::empty())
        .unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&body_string(server.send(req).await).await).unwrap();
    assert_eq!(json["processedString"], "8.8.8.8 - Unknown ISP");

    let req = Request::get(server.url("/getIP.php"))
        .header("X-Real-IP", "8.8.4.4")
        .body(Body::empty())
        .unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&body_string(server.send(req).await).await).unwrap();
    assert_eq!(json["processedString"], "8.8.4.4");
}

#[tokio::test]
async fn stats_disabled_without_retention() {
    let server = start(Options {
        store: Arc::new(NullStore::new()),
        ..Default::default()
    });
    let res = server.get("/stats?id=L100").await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(res).await, "Statistics are disabled");
}

#[tokio::test]
async fn stats_locked_with_default_password() {
    let server = start(Options {
        stats_password: DEFAULT_STATS_PASSWORD.to_string(),
        ..Default::default()
    });
    let req = Request::get(server.url("/stats?id=L100"))
        .header(header::AUTHORIZATION, format!("Bearer {}", DEFAULT_STATS_PASSWORD))
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.send(req).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn stats_requires_bearer() {
    let server = start(Options::default());
    assert_eq!(
        server.get("/stats?id=L100").await.status(),
        StatusCode::UNAUTHORIZED
    );

    let req = Request::get(server.url("/stats?id=L100"))
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.send(req).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn stats_lists_recent_and_single() {
    let server = start(Options::default());
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(submit(&server, &format!("dl={}", n)).await);
    }

    let req = Request::get(server.url("/stats?id=L100"))
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let res = server.send(req).await;
    assert_eq!(res.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
    let got: Vec<&str> = json["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(got, vec![ids[2].as_str(), ids[1].as_str(), ids[0].as_str()]);

    let req = Request::post(server.url("/stats.php"))
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::from(format!("id={}", ids[1])))
        .unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&body_string(server.send(req).await).await).unwrap();
    assert_eq!(json["records"][0]["download"], "1");
}

#[tokio::test]
async fn preflight_and_unknown_routes() {
    let server = start(Options::default());

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri(server.url("/results/telemetry"))
        .body(Body::empty())
        .unwrap();
    let res = server.send(req).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(
        res.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
        "GET, POST, OPTIONS"
    );

    assert_eq!(server.get("/index.html").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        server.get("/results/telemetry").await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );
}
