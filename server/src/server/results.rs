//! Telemetry submission, result lookup and the statistics view

use super::api::{
    client_ip, decode_form, form_value, json_response, query_param, read_body, text_response,
    ApiState, BodyError,
};
use super::auth::check_bearer;
use crate::audit;
use crate::config::DEFAULT_STATS_PASSWORD;
use crate::metrics;
use crate::redact::redact_record;
use crate::storage::{StoreError, RECENT_LIMIT};
use hyper::header::{self, HeaderMap};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use speedtest_shared::{TelemetryForm, TelemetryRecord};
use std::future::Future;
use std::net::SocketAddr;

/// Largest telemetry form accepted. Test logs can be long.
pub const MAX_FORM_BYTES: usize = 4 * 1024 * 1024;

/// Stats requests only carry an id.
const MAX_STATS_FORM_BYTES: usize = 64 * 1024;

/// Magic id that selects the most recent records.
const RECENT_ID: &str = "L100";

#[derive(Debug, Serialize)]
struct StatsResponse {
    records: Vec<TelemetryRecord>,
}

async fn timed<T>(op: &str, fut: impl Future<Output = T>) -> T {
    let timer = metrics::STORE_OP_DURATION
        .with_label_values(&[op])
        .start_timer();
    let out = fut.await;
    timer.observe_duration();
    out
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// `POST /results/telemetry`: persist one finished test and answer `id <id>`.
pub async fn record(req: Request<Body>, peer: SocketAddr, state: &ApiState) -> Response<Body> {
    let ip = client_ip(req.headers(), peer);
    let user_agent = header_string(req.headers(), header::USER_AGENT);
    let language = header_string(req.headers(), header::ACCEPT_LANGUAGE);

    let body = match read_body(req.into_body(), MAX_FORM_BYTES).await {
        Ok(body) => body,
        Err(e @ BodyError::TooLarge(_)) => {
            tracing::warn!("Rejected telemetry from {}: {}", ip, e);
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "telemetry too large\n");
        }
        Err(e) => {
            tracing::debug!("Telemetry upload from {} interrupted: {}", ip, e);
            return text_response(StatusCode::BAD_REQUEST, "incomplete request body\n");
        }
    };

    let form: TelemetryForm = match decode_form(&body) {
        Ok(form) => form,
        Err(e) => {
            tracing::warn!("Undecodable telemetry form from {}: {}", ip, e);
            return text_response(StatusCode::BAD_REQUEST, "invalid form body\n");
        }
    };

    let mut record = form.into_record(ip, user_agent, language);
    if state.redact_ip {
        redact_record(&mut record);
    }

    match timed("insert", state.store.insert(record)).await {
        Ok(id) => {
            metrics::TELEMETRY_INSERT_TOTAL
                .with_label_values(&["ok"])
                .inc();
            audit::telemetry_recorded(&id, state.store.backend(), state.redact_ip);
            text_response(StatusCode::OK, format!("id {}", id))
        }
        Err(e) => {
            metrics::TELEMETRY_INSERT_TOTAL
                .with_label_values(&["error"])
                .inc();
            tracing::error!("Error inserting telemetry: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "storage error\n")
        }
    }
}

/// `GET /results?id=<id>`: one stored record as JSON.
pub async fn fetch(req: &Request<Body>, state: &ApiState) -> Response<Body> {
    let Some(id) = query_param(req.uri(), "id").filter(|id| !id.is_empty()) else {
        return text_response(StatusCode::BAD_REQUEST, "missing id\n");
    };

    match timed("fetch_by_id", state.store.fetch_by_id(&id)).await {
        Ok(record) => json_response(StatusCode::OK, &record),
        Err(StoreError::NotFound(_)) => text_response(StatusCode::NOT_FOUND, "record not found\n"),
        Err(e) => {
            tracing::error!("Error fetching result {}: {}", id, e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "storage error\n")
        }
    }
}

/// `GET|POST /stats`: password protected view of stored records.
pub async fn stats(req: Request<Body>, state: &ApiState) -> Response<Body> {
    if !state.store.retains_records() {
        return text_response(StatusCode::FORBIDDEN, "Statistics are disabled");
    }

    if state.stats_password == DEFAULT_STATS_PASSWORD {
        audit::stats_auth_failure("default password in use");
        return text_response(
            StatusCode::FORBIDDEN,
            "Set statistics_password to enable the statistics view",
        );
    }

    if let Err(e) = check_bearer(req.headers().get(header::AUTHORIZATION), &state.stats_password) {
        let mut res = text_response(StatusCode::UNAUTHORIZED, format!("{}\n", e));
        res.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            header::HeaderValue::from_static("Bearer"),
        );
        return res;
    }

    let mut id = query_param(req.uri(), "id");
    if id.is_none() && req.method() == Method::POST {
        id = match read_body(req.into_body(), MAX_STATS_FORM_BYTES).await {
            Ok(body) => form_value(&body, "id"),
            Err(e) => {
                tracing::debug!("Stats request body rejected: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "invalid request body\n");
            }
        };
    }

    let records = match id.as_deref() {
        None | Some("") => return text_response(StatusCode::BAD_REQUEST, "missing id\n"),
        Some(RECENT_ID) => timed("fetch_recent", state.store.fetch_recent(RECENT_LIMIT)).await,
        Some(id) => timed("fetch_by_id", state.store.fetch_by_id(id))
            .await
            .map(|record| vec![record]),
    };

    match records {
        Ok(records) => json_response(StatusCode::OK, &StatsResponse { records }),
        Err(StoreError::NotFound(_)) => text_response(StatusCode::NOT_FOUND, "record not found\n"),
        Err(e) => {
            tracing::error!("Error querying statistics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "storage error\n")
        }
    }
}
