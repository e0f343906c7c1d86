//! Prometheus metrics for pailstore.
//!
//! Installs a global Prometheus recorder using
//! `metrics-exporter-prometheus`, defines metric name constants,
//! provides a Tower-compatible middleware for HTTP RED metrics, and
//! exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "pailstore_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "pailstore_http_request_duration_seconds";

/// Total storage operations (counter). Labels: operation, status.
pub const STORAGE_OPERATIONS_TOTAL: &str = "pailstore_storage_operations_total";

/// Total bytes received in request bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "pailstore_bytes_received_total";

/// Total bytes sent in response bodies (counter).
pub const BYTES_SENT_TOTAL: &str = "pailstore_bytes_sent_total";

/// Expired upload sessions cleaned by the sweeper (counter).
pub const SESSIONS_SWEPT_TOTAL: &str = "pailstore_sessions_swept_total";

/// Open resumable upload sessions (gauge; best-effort).
pub const UPLOAD_SESSIONS_OPEN: &str = "pailstore_upload_sessions_open";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to
/// call multiple times (e.g. in tests). Returns the global handle.
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
    describe_counter!(STORAGE_OPERATIONS_TOTAL, "Total storage operations by type");
    describe_counter!(
        BYTES_RECEIVED_TOTAL,
        "Total bytes received (request bodies)"
    );
    describe_counter!(BYTES_SENT_TOTAL, "Total bytes sent (response bodies)");
    describe_counter!(SESSIONS_SWEPT_TOTAL, "Expired upload sessions removed");
    describe_gauge!(UPLOAD_SESSIONS_OPEN, "Open resumable upload sessions");

    // Seed gauges so they appear in /metrics output immediately.
    counter!(STORAGE_OPERATIONS_TOTAL, "operation" => "seed", "status" => "success").absolute(0);
    gauge!(UPLOAD_SESSIONS_OPEN).set(0.0);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback
/// loops. Must be the outermost layer so it captures the full request
/// lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let path = normalize_path(&raw_path);

    // Do not instrument the metrics endpoint itself.
    if raw_path == "/metrics" {
        return next.run(req).await;
    }

    // Capture request body size by consuming and reconstructing the body.
    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();
    let req_size = body_bytes.len() as f64;
    let req = Request::from_parts(parts, axum::body::Body::from(body_bytes));

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    // Capture response body size by consuming and reconstructing the response.
    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = axum::body::to_bytes(resp_body, usize::MAX)
        .await
        .unwrap_or_default();
    let resp_size = resp_bytes.len() as f64;
    let response = Response::from_parts(resp_parts, axum::body::Body::from(resp_bytes));

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method.clone(), "path" => path.clone())
        .record(duration);
    counter!(BYTES_RECEIVED_TOTAL).increment(req_size as u64);
    counter!(BYTES_SENT_TOTAL).increment(resp_size as u64);

    if let Some(operation) = map_storage_operation(&method, &path) {
        let op_status = if response.status().is_success() {
            "success"
        } else {
            "error"
        };
        counter!(STORAGE_OPERATIONS_TOTAL, "operation" => operation, "status" => op_status.to_string())
            .increment(1);
    }

    response
}

// -- Operation mapping --------------------------------------------------------

/// Map a method + normalized path to a storage operation name.
/// Returns `None` for non-storage endpoints (health, metrics, docs).
fn map_storage_operation(method: &str, path: &str) -> Option<String> {
    let op = match (method, path) {
        ("GET", "/storage/v1/bucket") => "ListBuckets",
        ("POST", "/storage/v1/bucket") => "CreateBucket",
        ("GET", "/storage/v1/bucket/{id}") => "GetBucket",
        ("PUT", "/storage/v1/bucket/{id}") => "UpdateBucket",
        ("DELETE", "/storage/v1/bucket/{id}") => "DeleteBucket",
        ("POST", "/storage/v1/bucket/{id}/empty") => "EmptyBucket",
        ("POST", "/storage/v1/object/list/{bucket}") => "ListObjects",
        ("POST", "/storage/v1/object/copy") => "CopyObject",
        ("POST", "/storage/v1/object/move") => "MoveObject",
        ("GET", "/storage/v1/object/{bucket}/{key}") => "DownloadObject",
        ("HEAD", "/storage/v1/object/{bucket}/{key}") => "HeadObject",
        ("POST", "/storage/v1/object/{bucket}/{key}")
        | ("PUT", "/storage/v1/object/{bucket}/{key}") => "UploadObject",
        ("DELETE", "/storage/v1/object/{bucket}/{key}") => "DeleteObject",
        ("DELETE", "/storage/v1/object/{bucket}") => "DeleteObjects",
        ("POST", "/storage/v1/upload/resumable") => "CreateUploadSession",
        ("HEAD", "/storage/v1/upload/resumable/{id}") => "HeadUploadSession",
        ("PATCH", "/storage/v1/upload/resumable/{id}")
        | ("PUT", "/storage/v1/upload/resumable/{id}") => "AppendChunk",
        ("DELETE", "/storage/v1/upload/resumable/{id}") => "CancelUploadSession",
        _ => return None,
    };
    Some(op.to_string())
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric
/// labels, preventing high-cardinality labels from unique bucket/key
/// names.
fn normalize_path(path: &str) -> String {
    match path {
        "/health" | "/healthz" | "/readyz" | "/docs" | "/openapi.json" | "/metrics" => {
            return path.to_string()
        }
        _ => {}
    }

    if let Some(rest) = path.strip_prefix("/storage/v1/upload/resumable") {
        return if rest.is_empty() || rest == "/" {
            "/storage/v1/upload/resumable".to_string()
        } else {
            "/storage/v1/upload/resumable/{id}".to_string()
        };
    }

    if let Some(rest) = path.strip_prefix("/storage/v1/bucket") {
        let rest = rest.trim_start_matches('/');
        return match rest {
            "" => "/storage/v1/bucket".to_string(),
            _ if rest.ends_with("/empty") => "/storage/v1/bucket/{id}/empty".to_string(),
            _ => "/storage/v1/bucket/{id}".to_string(),
        };
    }

    if let Some(rest) = path.strip_prefix("/storage/v1/object") {
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return "/storage/v1/object".to_string();
        }
        // Fixed single-segment endpoints keep their names; everything
        // else collapses to bucket/key shapes.
        let first = rest.split('/').next().unwrap_or("");
        return match first {
            "copy" | "move" => format!("/storage/v1/object/{first}"),
            "list" => "/storage/v1/object/list/{bucket}".to_string(),
            _ => match rest.find('/') {
                None => "/storage/v1/object/{bucket}".to_string(),
                Some(_) => "/storage/v1/object/{bucket}/{key}".to_string(),
            },
        };
    }

    "/other".to_string()
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = PROMETHEUS_HANDLE
        .get()
        .expect("Prometheus recorder not initialized");
    let body = handle.render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
