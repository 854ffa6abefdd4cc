use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use futures::future::ready;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub async fn index() -> &'static str {
    "archive ingest service"
}

/// Health and metrics routes for the ingest service.
pub fn router() -> Result<Router, BuildError> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    setup_metrics_routes(router)
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
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
            get(move || ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // seconds; covers slow store puts and catalog inserts
    const BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
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
