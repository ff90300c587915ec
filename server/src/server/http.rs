//! Admin listener: liveness, store readiness and Prometheus metrics.

use crate::audit;
use crate::metrics;
use crate::storage::TelemetryStore;
use hyper::header;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminRoute {
    Health,
    Ready,
    Metrics,
}

impl AdminRoute {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            "/healthz" => Some(AdminRoute::Health),
            "/readyz" => Some(AdminRoute::Ready),
            "/metrics" => Some(AdminRoute::Metrics),
            _ => None,
        }
    }

    fn path(self) -> &'static str {
        match self {
            AdminRoute::Health => "/healthz",
            AdminRoute::Ready => "/readyz",
            AdminRoute::Metrics => "/metrics",
        }
    }
}

/// Serve the admin endpoints on `addr` until `shutdown` fires.
pub async fn serve_admin(
    addr: SocketAddr,
    store: Arc<dyn TelemetryStore>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let store = store.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let store = store.clone();
                async move { Ok::<_, hyper::Error>(handle(req.uri().path(), store.as_ref()).await) }
            }))
        }
    });

    tracing::info!("Admin HTTP server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn handle(path: &str, store: &dyn TelemetryStore) -> Response<Body> {
    let Some(route) = AdminRoute::from_path(path) else {
        return plain(StatusCode::NOT_FOUND, "not found\n".to_string());
    };

    let response = match route {
        AdminRoute::Health => plain(StatusCode::OK, "ok\n".to_string()),
        AdminRoute::Ready => readiness(store).await,
        AdminRoute::Metrics => Response::builder()
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(metrics::encode_metrics()))
            .expect("response build"),
    };

    audit::admin_http_request(route.path(), response.status().as_u16());
    response
}

/// Ready once the store answers a one-record read.
async fn readiness(store: &dyn TelemetryStore) -> Response<Body> {
    let backend = store.backend();
    match store.fetch_recent(1).await {
        Ok(_) => plain(StatusCode::OK, format!("ready ({})\n", backend)),
        Err(e) => {
            tracing::warn!("{} store not ready: {}", backend, e);
            plain(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("not ready ({}): {}\n", backend, e),
            )
        }
    }
}

fn plain(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .expect("response build")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::null::NullStore;
    use crate::storage::StoreError;
    use async_trait::async_trait;
    use speedtest_shared::TelemetryRecord;

    struct Unreachable;

    #[async_trait]
    impl TelemetryStore for Unreachable {
        async fn insert(&self, _record: TelemetryRecord) -> Result<String, StoreError> {
            Err(StoreError::storage("connection refused"))
        }

        async fn fetch_by_id(&self, _id: &str) -> Result<TelemetryRecord, StoreError> {
            Err(StoreError::storage("connection refused"))
        }

        async fn fetch_recent(&self, _limit: usize) -> Result<Vec<TelemetryRecord>, StoreError> {
            Err(StoreError::storage("connection refused"))
        }

        fn backend(&self) -> &'static str {
            "postgresql"
        }
    }

    async fn get(path: &str, store: &dyn TelemetryStore) -> (StatusCode, String) {
        let res = handle(path, store).await;
        let status = res.status();
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_health_and_unknown_paths() {
        let store = MemoryStore::new();
        assert_eq!(get("/healthz", &store).await, (StatusCode::OK, "ok\n".to_string()));
        assert_eq!(get("/nope", &store).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_readyz_names_backend() {
        let (status, body) = get("/readyz", &MemoryStore::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready (memory)\n");

        let (status, body) = get("/readyz", &NullStore::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("none"), "{}", body);

        let (status, body) = get("/readyz", &Unreachable).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body,
            "not ready (postgresql): storage error: connection refused\n"
        );
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        metrics::HTTP_REQUESTS_TOTAL
            .with_label_values(&["garbage"])
            .inc();
        let (status, body) = get("/metrics", &MemoryStore::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("speedtest_http_requests_total"));
    }
}
