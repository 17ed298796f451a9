use crate::error::{AppError, Result};
use axum::{extract::State, http::header, response::IntoResponse};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            AppError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        // Host metrics
        describe_counter!(
            "accel_requests_total",
            "Total number of requests forwarded to backends"
        );
        describe_histogram!(
            "accel_request_duration_seconds",
            "Backend request latencies in seconds"
        );
        describe_counter!(
            "accel_requests_errors_total",
            "Total number of backend requests that resulted in errors"
        );

        // Limiter metrics
        describe_counter!(
            "accel_redirects_total",
            "Internal redirects performed, labelled by whether a limit was attached"
        );
        describe_counter!(
            "accel_signal_parse_errors_total",
            "Redirect signals with an unusable header value"
        );
        describe_gauge!("accel_active_buckets", "Token buckets held by the registry");
        describe_counter!(
            "accel_paced_bytes_total",
            "Response bytes released through a token bucket"
        );
        describe_counter!(
            "accel_pacing_waits_total",
            "Times a paced stream slept waiting for tokens"
        );

        // Store metrics
        describe_gauge!(
            "accel_store_healthy",
            "Shared state store health (1 = healthy, 0 = unhealthy, limiting disabled)"
        );
        describe_counter!(
            "accel_store_failures_total",
            "Store operations that failed after all retries"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Get the Prometheus metrics handle
    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// Record a backend request
pub fn record_request(method: &str, path: &str, backend: &str, status: u16, duration: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("backend", backend.to_string()),
        ("status", status.to_string()),
    ];

    counter!("accel_requests_total", &labels).increment(1);
    histogram!("accel_request_duration_seconds", &labels).record(duration);

    if status >= 400 {
        counter!("accel_requests_errors_total", &labels).increment(1);
    }
}

/// Record an internal redirect
pub fn record_redirect(limited: bool) {
    let labels = [("limited", limited.to_string())];
    counter!("accel_redirects_total", &labels).increment(1);
}

/// Record a signal header that could not be used
pub fn record_signal_parse_error(field: &str) {
    let labels = [("field", field.to_string())];
    counter!("accel_signal_parse_errors_total", &labels).increment(1);
}

pub fn record_active_buckets(count: usize) {
    gauge!("accel_active_buckets").set(count as f64);
}

pub fn record_paced_bytes(bytes: u64) {
    counter!("accel_paced_bytes_total").increment(bytes);
}

pub fn record_pacing_wait() {
    counter!("accel_pacing_waits_total").increment(1);
}

/// Record shared state store health
pub fn record_store_health(healthy: bool) {
    gauge!("accel_store_healthy").set(if healthy { 1.0 } else { 0.0 });
}

/// Record a store operation that exhausted its retries
pub fn record_store_failure(op: &str) {
    let labels = [("op", op.to_string())];
    counter!("accel_store_failures_total", &labels).increment(1);
}

/// Sanitize path for metrics to avoid cardinality explosion
fn sanitize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| if is_likely_id(seg) { ":id" } else { seg })
        .collect::<Vec<_>>()
        .join("/")
}

/// Check if a path segment is likely an ID (numeric, UUID, hash)
fn is_likely_id(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }

    if segment.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    if segment.len() >= 32 && segment.contains('-') {
        return segment.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
    }

    // Mixed letters and digits, like ObjectIds or content hashes
    segment.len() > 10
        && segment.chars().all(|c| c.is_ascii_alphanumeric())
        && segment.chars().any(|c| c.is_ascii_digit())
        && segment.chars().any(|c| c.is_ascii_alphabetic())
}

/// Timer for measuring backend request duration
pub struct Timer {
    start: Instant,
    method: String,
    path: String,
    backend: Option<String>,
}

impl Timer {
    pub fn new(method: String, path: String) -> Self {
        Self {
            start: Instant::now(),
            method,
            path,
            backend: None,
        }
    }

    pub fn set_backend(&mut self, backend: String) {
        self.backend = Some(backend);
    }

    /// Record the elapsed time with the given status code
    pub fn record(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();
        let backend = self.backend.as_deref().unwrap_or("none");
        record_request(&self.method, &self.path, backend, status, duration);
    }

    /// Elapsed time in seconds
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
