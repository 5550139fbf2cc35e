use std::time::{Duration, Instant};

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const MESSAGES_RECEIVED: &str = "ingestion_messages_received";
pub const MESSAGES_DROPPED: &str = "ingestion_messages_dropped";
pub const MESSAGES_NACKED: &str = "ingestion_messages_nacked";
pub const EVENTS_PERSISTED: &str = "ingestion_events_persisted";
pub const BATCHES: &str = "ingestion_batches";
pub const BATCH_DURATION: &str = "ingestion_batch_duration_seconds";
pub const LOOP_ERRORS: &str = "ingestion_loop_errors";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// This function is intended to take a Router as returned by `setup_metrics_routes`.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(BATCH_DURATION_BUCKETS)?
        .install_recorder()
}

/// Batch cycles are dominated by one round-trip to the store, plus at most one fetch wait.
const BATCH_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Messages handed out by the broker in one fetch.
pub fn messages_received(count: usize) {
    metrics::counter!(MESSAGES_RECEIVED).increment(count as u64);
}

/// A message acknowledged without being persisted, labelled by why it was unprocessable.
pub fn message_dropped(reason: &'static str) {
    metrics::counter!(MESSAGES_DROPPED, "reason" => reason).increment(1);
}

/// Messages scheduled for redelivery after a failed write.
pub fn messages_nacked(count: usize) {
    metrics::counter!(MESSAGES_NACKED).increment(count as u64);
}

/// Rows actually inserted, so redelivered duplicates are not counted twice.
pub fn events_persisted(inserted: u64) {
    metrics::counter!(EVENTS_PERSISTED).increment(inserted);
}

pub fn batch_completed(status: &'static str, duration: Duration) {
    metrics::counter!(BATCHES, "status" => status).increment(1);
    metrics::histogram!(BATCH_DURATION).record(duration.as_secs_f64());
}

pub fn loop_error() {
    metrics::counter!(LOOP_ERRORS).increment(1);
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
