//! Audit logging for security and operational events.
//!
//! All events are emitted via `tracing` with a dedicated target so they can be
//! filtered and formatted (e.g. JSON) for audit pipelines.

use tracing::{info, warn};

const AUDIT_TARGET: &str = "speedtest::audit";

/// Log a successful statistics viewer login.
pub fn stats_auth_success() {
    info!(
        target: AUDIT_TARGET,
        event = "stats_auth_success",
        result = "ok",
    );
}

/// Log a rejected statistics viewer request.
pub fn stats_auth_failure(reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "stats_auth_failure",
        result = "denied",
        reason = %reason,
    );
}

/// Log a persisted telemetry record.
pub fn telemetry_recorded(id: &str, backend: &str, redacted: bool) {
    info!(
        target: AUDIT_TARGET,
        event = "telemetry_recorded",
        id = %id,
        backend = %backend,
        redacted = redacted,
    );
}

/// Log admin HTTP request (sensitive endpoints: metrics, readiness).
pub fn admin_http_request(path: &str, status: u16) {
    info!(
        target: AUDIT_TARGET,
        event = "admin_http_request",
        path = %path,
        status = %status,
    );
}
