//! Prometheus metrics for chunkvault.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "chunkvault_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "chunkvault_http_request_duration_seconds";

/// Total bytes streamed in response bodies (counter).
pub const BYTES_SENT_TOTAL: &str = "chunkvault_bytes_sent_total";

/// Response bodies currently streaming from a backend (gauge).
pub const ACTIVE_STREAMS: &str = "chunkvault_active_streams";

/// Operations riding each pool connection (gauge). Labels: connection.
pub const POOL_IN_FLIGHT: &str = "chunkvault_pool_in_flight";

/// Rate-limit backoffs taken while streaming (counter).
pub const RATE_LIMIT_BACKOFFS_TOTAL: &str = "chunkvault_rate_limit_backoffs_total";

/// Finished uploads (counter). Labels: status.
pub const UPLOADS_TOTAL: &str = "chunkvault_uploads_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(BYTES_SENT_TOTAL, "Total bytes streamed to clients");
    describe_gauge!(ACTIVE_STREAMS, "Response bodies currently streaming");
    describe_gauge!(POOL_IN_FLIGHT, "In-flight operations per backend connection");
    describe_counter!(
        RATE_LIMIT_BACKOFFS_TOTAL,
        "Backend rate-limit backoffs taken while streaming"
    );
    describe_counter!(UPLOADS_TOTAL, "Finished uploads by outcome");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Object ids, file ids and task ids are collapsed so labels stay
/// low-cardinality.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/objects/abc` -> `/objects/{id}`
/// - `/objects/abc/download` -> `/objects/{id}/download`
/// - `/api/progress/u1_x` -> `/api/progress/{task_id}`
/// - `/nope/at/all` -> `/other`
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let template = match segments.as_slice() {
        [""] => "/",
        ["health"] => "/health",
        ["metrics"] => "/metrics",
        ["openapi.json"] => "/openapi.json",
        ["objects", _] => "/objects/{id}",
        ["objects", _, "download"] => "/objects/{id}/download",
        ["api", "stream", _] => "/api/stream/{id}",
        ["api", "download", _] => "/api/download/{id}",
        ["api", "files"] => "/api/files",
        ["api", "files", _] => "/api/files/{id}",
        ["api", "progress", _] => "/api/progress/{task_id}",
        ["api", "upload"] => "/api/upload",
        ["api", "download-url"] => "/api/download-url",
        ["api", "stats"] => "/api/stats",
        ["api", "backup"] => "/api/backup",
        ["api", "restore"] => "/api/restore",
        _ => "/other",
    };
    template.to_string()
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let Some(handle) = PROMETHEUS_HANDLE.get() else {
        return (
            StatusCode::NOT_FOUND,
            [("content-type", "text/plain")],
            "metrics disabled\n".to_string(),
        );
    };
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
}

// -- Tests --------------------------------------------------------------------
