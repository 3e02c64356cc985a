//! Prometheus metrics for the API server.

use std::sync::LazyLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use regex_lite::Regex;

/// Install the Prometheus recorder and return its render handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "basejobs_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "basejobs_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "basejobs_http_requests_in_flight";

    // WebSocket metrics
    pub const WS_CONNECTIONS_TOTAL: &str = "basejobs_ws_connections_total";
    pub const WS_CONNECTIONS_ACTIVE: &str = "basejobs_ws_connections_active";
    pub const WS_MESSAGES_SENT: &str = "basejobs_ws_messages_sent_total";
    pub const WS_MESSAGES_RECEIVED: &str = "basejobs_ws_messages_received_total";
    pub const WS_EVENTS_RELAYED: &str = "basejobs_ws_events_relayed_total";
    pub const WS_CLIENTS_DROPPED: &str = "basejobs_ws_clients_dropped_total";
}

static UUID_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").ok()
});
static JOB_ID_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/jobs/[a-zA-Z0-9_-]+").ok());

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record WebSocket connection.
pub fn record_ws_connection(endpoint: &str) {
    let labels = [("endpoint", endpoint.to_string())];
    counter!(names::WS_CONNECTIONS_TOTAL, &labels).increment(1);
}

/// Update active WebSocket connections gauge.
pub fn set_ws_active_connections(count: i64) {
    gauge!(names::WS_CONNECTIONS_ACTIVE).set(count as f64);
}

/// Record WebSocket message sent.
pub fn record_ws_message_sent(endpoint: &str, message_type: &str) {
    let labels = [
        ("endpoint", endpoint.to_string()),
        ("type", message_type.to_string()),
    ];
    counter!(names::WS_MESSAGES_SENT, &labels).increment(1);
}

/// Record WebSocket message received.
pub fn record_ws_message_received(endpoint: &str) {
    let labels = [("endpoint", endpoint.to_string())];
    counter!(names::WS_MESSAGES_RECEIVED, &labels).increment(1);
}

pub fn record_ws_event_relayed(clients: usize) {
    counter!(names::WS_EVENTS_RELAYED).increment(clients as u64);
}

pub fn record_ws_client_dropped(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!(names::WS_CLIENTS_DROPPED, &labels).increment(1);
}

/// Sanitize path for metrics labels (remove IDs, etc.).
fn sanitize_path(path: &str) -> String {
    let mut path = path.to_string();
    if let Some(re) = JOB_ID_RE.as_ref() {
        path = re.replace_all(&path, "/jobs/:job_id").into_owned();
    }
    if let Some(re) = UUID_RE.as_ref() {
        path = re.replace_all(&path, ":id").into_owned();
    }
    path
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
