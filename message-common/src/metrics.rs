use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Request latency buckets, in seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Install the global Prometheus recorder, then expose it on `/metrics` of `router`.
/// Every route of `router`, including `/metrics`, is tracked by [`track_metrics`].
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let handle = setup_metrics_recorder()?;

    Ok(router
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)?
        .install_recorder()
}

/// Count requests and record their latency, labelled by method, route and status code.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Label by route template so path parameters don't blow up cardinality.
    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
