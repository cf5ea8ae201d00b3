//! Request logging middleware.
//!
//! One line per request with method, path, status and latency. The ingest
//! route is high-volume, so its successes log at DEBUG.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, info, warn};

fn is_ingest(path: &str) -> bool {
    path.starts_with("/games/") && path.ends_with("/ingest")
}

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_us = start.elapsed().as_micros() as u64;
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_us, "Request failed (5xx)");
    } else if status < 400 && is_ingest(&path) {
        debug!(method = %method, path = %path, status, latency_us, "Ingest completed");
    } else {
        info!(method = %method, path = %path, status, latency_us, "Request completed");
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_path_detection() {
        assert!(is_ingest("/games/G1/ingest"));
        assert!(!is_ingest("/games/G1/start"));
        assert!(!is_ingest("/search"));
    }
}
